//! Lexical scopes as an arena of owned nodes.
//!
//! Scopes are stored in a vector and refer to their parent by index, so
//! lookup walks a parent chain without any shared ownership. Exited scopes
//! stay in the arena; only the cursor moves.

use indexmap::IndexMap;

use crate::source::Location;

use super::types::Type;

/// What a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Parameter,
    Function,
    Struct,
    Message,
}

/// A declared name.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: Type,
    pub is_const: bool,
    pub location: Location,
    /// Parameter types, for functions.
    pub params: Option<Vec<Type>>,
    /// Return type, for functions.
    pub return_type: Option<Type>,
}

impl Symbol {
    /// A plain variable symbol.
    pub fn variable(name: &str, ty: Type, is_const: bool, location: Location) -> Self {
        Self {
            name: name.to_owned(),
            kind: SymbolKind::Variable,
            ty,
            is_const,
            location,
            params: None,
            return_type: None,
        }
    }

    /// A function symbol with its signature.
    pub fn function(
        name: &str,
        params: Vec<Type>,
        return_type: Type,
        location: Location,
    ) -> Self {
        Self {
            name: name.to_owned(),
            kind: SymbolKind::Function,
            ty: Type::Void.pointer_to(),
            is_const: true,
            location,
            params: Some(params),
            return_type: Some(return_type),
        }
    }
}

/// Index of a scope in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

#[derive(Debug)]
struct Scope {
    symbols: IndexMap<String, Symbol>,
    parent: Option<ScopeId>,
}

/// The scope stack. Shadowing across scopes is allowed; redefinition inside
/// one scope is the caller's error to report.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    current: ScopeId,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// A table with only the global scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                symbols: IndexMap::new(),
                parent: None,
            }],
            current: ScopeId(0),
        }
    }

    /// Open a child of the current scope and move into it.
    pub fn enter(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            symbols: IndexMap::new(),
            parent: Some(self.current),
        });
        self.current = id;
        id
    }

    /// Move back to the parent scope.
    pub fn exit(&mut self) {
        if let Some(parent) = self.scopes[self.current.0].parent {
            self.current = parent;
        }
    }

    /// Define a symbol in the current scope. Returns the previous symbol of
    /// the same name in this scope, if any — a redefinition.
    pub fn define(&mut self, symbol: Symbol) -> Option<Symbol> {
        self.scopes[self.current.0]
            .symbols
            .insert(symbol.name.clone(), symbol)
    }

    /// Look a name up through the parent chain.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        let mut scope = Some(self.current);
        while let Some(id) = scope {
            if let Some(symbol) = self.scopes[id.0].symbols.get(name) {
                return Some(symbol);
            }
            scope = self.scopes[id.0].parent;
        }
        None
    }

    /// Look a name up in the current scope only.
    pub fn lookup_local(&self, name: &str) -> Option<&Symbol> {
        self.scopes[self.current.0].symbols.get(name)
    }

    /// Whether the current scope is the global one.
    pub fn at_global_scope(&self) -> bool {
        self.current == ScopeId(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol::variable(name, Type::Int, false, Location::unknown())
    }

    #[test]
    fn shadowing_across_scopes() {
        let mut table = SymbolTable::new();
        assert!(table.define(sym("x")).is_none());
        table.enter();
        assert!(table.define(sym("x")).is_none());
        assert!(table.lookup("x").is_some());
        table.exit();
        assert!(table.lookup("x").is_some());
    }

    #[test]
    fn redefinition_in_same_scope_is_detected() {
        let mut table = SymbolTable::new();
        assert!(table.define(sym("x")).is_none());
        assert!(table.define(sym("x")).is_some());
    }

    #[test]
    fn lookup_walks_parents() {
        let mut table = SymbolTable::new();
        table.define(sym("g"));
        table.enter();
        table.enter();
        assert!(table.lookup("g").is_some());
        assert!(table.lookup_local("g").is_none());
    }
}
