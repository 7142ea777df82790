//! Semantic analysis: scope construction, type checking and the intrinsic
//! signature gate.
//!
//! The analyzer walks the AST once, recording every violation instead of
//! stopping at the first; compilation fails afterwards if anything was
//! recorded.

mod builtins;
mod scope;
mod types;

pub use builtins::{by_name as intrinsic_by_name, signature as intrinsic_signature};
pub use scope::{ScopeId, Symbol, SymbolKind, SymbolTable};
pub use types::Type;

use crate::{
    ast::*,
    layout::{LayoutError, StructLayoutTable},
    source::Location,
};

/// A positioned semantic violation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SemanticError {
    #[error("{location}: redefinition of '{name}'")]
    Redefinition { name: String, location: Location },
    #[error("{location}: undefined identifier '{name}'")]
    Undefined { name: String, location: Location },
    #[error("{location}: cannot assign to const '{name}'")]
    ConstWrite { name: String, location: Location },
    #[error("{location}: {message}")]
    TypeError { message: String, location: Location },
    #[error("{location}: '{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        location: Location,
    },
    #[error("{location}: no field '{field}' in '{aggregate}'")]
    UnknownField {
        aggregate: String,
        field: String,
        location: Location,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("program has no 'main' function")]
    MissingMain,
}

/// Run semantic analysis over a parsed program, registering aggregates into
/// `layouts` along the way.
pub fn analyze(
    program: &Program,
    layouts: &mut StructLayoutTable,
) -> Result<(), Vec<SemanticError>> {
    let mut analyzer = Analyzer {
        symbols: SymbolTable::new(),
        layouts,
        errors: Vec::new(),
        current_return: None,
    };
    analyzer.run(program);

    if analyzer.errors.is_empty() {
        Ok(())
    } else {
        Err(analyzer.errors)
    }
}

struct Analyzer<'a> {
    symbols: SymbolTable,
    layouts: &'a mut StructLayoutTable,
    errors: Vec<SemanticError>,
    current_return: Option<Type>,
}

impl Analyzer<'_> {
    fn run(&mut self, program: &Program) {
        // Pass 1: aggregate registration and function signatures, so that
        // declaration order does not matter between top-level items.
        for decl in &program.declarations {
            match decl {
                Decl::Struct(s) => {
                    self.layouts.register_struct(s);
                    self.declare(Symbol {
                        name: s.name.clone(),
                        kind: SymbolKind::Struct,
                        ty: Type::Struct(s.name.clone()),
                        is_const: true,
                        location: s.location.clone(),
                        params: None,
                        return_type: None,
                    });
                }
                Decl::Union(u) => {
                    self.layouts.register_union(u);
                    self.declare(Symbol {
                        name: u.name.clone(),
                        kind: SymbolKind::Struct,
                        ty: Type::Union(u.name.clone()),
                        is_const: true,
                        location: u.location.clone(),
                        params: None,
                        return_type: None,
                    });
                }
                Decl::Function(f) => {
                    let params = f.params.iter().map(|p| Type::from_ref(&p.ty)).collect();
                    self.declare(Symbol::function(
                        &f.name,
                        params,
                        Type::from_ref(&f.return_type),
                        f.location.clone(),
                    ));
                }
                _ => {}
            }
        }

        // Layouts can only be validated once everything is registered.
        let names: Vec<String> = self.layouts.names().cloned().collect();
        for name in names {
            if let Err(err) = self.layouts.layout(&name) {
                self.errors.push(err.into());
            }
        }

        // Pass 2: full checking in declaration order.
        for decl in &program.declarations {
            self.check_decl(decl);
        }

        match self.symbols.lookup("main") {
            Some(symbol) if symbol.kind == SymbolKind::Function => {}
            _ => self.errors.push(SemanticError::MissingMain),
        }
    }

    fn declare(&mut self, symbol: Symbol) {
        let name = symbol.name.clone();
        let location = symbol.location.clone();
        if self.symbols.define(symbol).is_some() {
            self.errors
                .push(SemanticError::Redefinition { name, location });
        }
    }

    fn type_error(&mut self, message: String, location: &Location) {
        self.errors.push(SemanticError::TypeError {
            message,
            location: location.clone(),
        });
    }

    fn check_decl(&mut self, decl: &Decl) {
        match decl {
            Decl::Function(f) => self.check_function(f),
            Decl::Variable(v) => self.check_variable(v),
            Decl::Array(a) => self.check_array(a),
            Decl::Message(m) => {
                self.declare(Symbol {
                    name: m.name.clone(),
                    kind: SymbolKind::Message,
                    ty: Type::from_ref(&m.element_type),
                    is_const: true,
                    location: m.location.clone(),
                    params: None,
                    return_type: None,
                });
            }
            // Registered in pass 1; includes were resolved by the driver.
            Decl::Struct(_) | Decl::Union(_) | Decl::Include(_) => {}
        }
    }

    fn check_function(&mut self, f: &FunctionDecl) {
        self.current_return = Some(Type::from_ref(&f.return_type));
        self.symbols.enter();

        for param in &f.params {
            let symbol = Symbol {
                name: param.name.clone(),
                kind: SymbolKind::Parameter,
                ty: Type::from_ref(&param.ty),
                is_const: false,
                location: param.location.clone(),
                params: None,
                return_type: None,
            };
            self.declare(symbol);
        }

        self.check_block(&f.body);
        self.symbols.exit();
        self.current_return = None;
    }

    fn check_variable(&mut self, v: &VariableDecl) {
        let ty = Type::from_ref(&v.ty);

        if let Type::Struct(name) | Type::Union(name) = &ty {
            if !self.layouts.is_known(name) {
                self.type_error(format!("unknown type '{name}'"), &v.location);
            }
        }

        if let Some(init) = &v.initializer {
            let init_ty = self.infer(init);
            if !init_ty.convertible_to(&ty) {
                self.type_error(
                    format!("cannot initialize '{}' of type {ty} with {init_ty}", v.name),
                    init.location(),
                );
            }
        }

        self.declare(Symbol::variable(&v.name, ty, v.is_const, v.location.clone()));
    }

    fn check_array(&mut self, a: &ArrayDecl) {
        let size_ty = self.infer(&a.size);
        if !size_ty.is_integer() {
            self.type_error(
                format!("array size must be an integer, got {size_ty}"),
                a.size.location(),
            );
        }

        let element = Type::from_ref(&a.element_type);
        if let Some(Expr::ArrayLiteral { elements, .. }) = &a.initializer {
            for value in elements {
                let value_ty = self.infer(value);
                if !value_ty.convertible_to(&element) {
                    self.type_error(
                        format!("array element of type {value_ty} does not fit {element}"),
                        value.location(),
                    );
                }
            }
        }

        self.declare(Symbol::variable(
            &a.name,
            Type::Array(Box::new(element), 0),
            false,
            a.location.clone(),
        ));
    }

    fn check_block(&mut self, block: &Block) {
        self.symbols.enter();
        for stmt in &block.statements {
            self.check_stmt(stmt);
        }
        self.symbols.exit();
    }

    fn check_condition(&mut self, condition: &Expr) {
        let ty = self.infer(condition);
        if !ty.is_condition() {
            self.type_error(
                format!("condition must be numeric, bool or pointer, got {ty}"),
                condition.location(),
            );
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(block) => self.check_block(block),
            Stmt::Expr(expr) => {
                self.infer(expr);
            }
            Stmt::Declaration(decl) => self.check_decl(decl),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.check_condition(condition);
                self.check_stmt(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_stmt(else_branch);
                }
            }
            Stmt::While { condition, body, .. } => {
                self.check_condition(condition);
                self.check_stmt(body);
            }
            Stmt::For {
                init,
                condition,
                update,
                body,
                ..
            } => {
                self.symbols.enter();
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(condition) = condition {
                    self.check_condition(condition);
                }
                if let Some(update) = update {
                    self.infer(update);
                }
                self.check_stmt(body);
                self.symbols.exit();
            }
            Stmt::Return { value, location } => self.check_return(value, location),
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
        }
    }

    fn check_return(&mut self, value: &Option<Expr>, location: &Location) {
        let Some(expected) = self.current_return.clone() else {
            self.type_error("return outside of a function".into(), location);
            return;
        };

        match value {
            None if expected == Type::Void => {}
            None => self.type_error(
                format!("function must return a value of type {expected}"),
                location,
            ),
            Some(value) if expected == Type::Void => {
                self.infer(value);
                self.type_error("void function must not return a value".into(), location);
            }
            Some(value) => {
                let ty = self.infer(value);
                if !ty.convertible_to(&expected) {
                    self.type_error(
                        format!("cannot return {ty} from a function returning {expected}"),
                        value.location(),
                    );
                }
            }
        }
    }

    fn is_lvalue(expr: &Expr) -> bool {
        matches!(
            expr,
            Expr::Identifier { .. }
                | Expr::Member { .. }
                | Expr::ArrayAccess { .. }
                | Expr::Dereference { .. }
        )
    }

    /// Infer an expression type, recording any violations. Returns `int` as
    /// a recovery type so one error does not cascade.
    fn infer(&mut self, expr: &Expr) -> Type {
        match expr {
            Expr::Literal { value, .. } => match value {
                LiteralValue::Int(_) => Type::Int,
                LiteralValue::Float(_) => Type::Float,
                LiteralValue::Char(_) => Type::Char,
                LiteralValue::Str(_) => Type::Str,
                LiteralValue::Bool(_) => Type::Bool,
            },
            Expr::Identifier { name, location } => match self.symbols.lookup(name) {
                Some(symbol) => symbol.ty.clone(),
                None => {
                    self.errors.push(SemanticError::Undefined {
                        name: name.clone(),
                        location: location.clone(),
                    });
                    Type::Int
                }
            },
            Expr::Binary {
                op,
                left,
                right,
                location,
            } => self.infer_binary(*op, left, right, location),
            Expr::Unary {
                op,
                operand,
                location,
            } => self.infer_unary(*op, operand, location),
            Expr::Postfix { operand, location, .. } => {
                if !Self::is_lvalue(operand) {
                    self.type_error("++/-- needs an assignable operand".into(), location);
                }
                let ty = self.infer(operand);
                if !ty.is_numeric() {
                    self.type_error(format!("++/-- needs a numeric operand, got {ty}"), location);
                }
                ty
            }
            Expr::Assignment {
                op,
                target,
                value,
                location,
            } => self.infer_assignment(*op, target, value, location),
            Expr::Call {
                callee,
                arguments,
                location,
            } => self.infer_call(callee, arguments, location),
            Expr::Member {
                object,
                field,
                via_pointer,
                location,
            } => self.infer_member(object, field, *via_pointer, location),
            Expr::ArrayAccess {
                array,
                index,
                location,
            } => {
                let index_ty = self.infer(index);
                if !index_ty.is_integer() {
                    self.type_error(
                        format!("array index must be an integer, got {index_ty}"),
                        index.location(),
                    );
                }
                match self.infer(array) {
                    Type::Array(element, _) => *element,
                    Type::Pointer(base) => *base,
                    other => {
                        self.type_error(
                            format!("cannot index into a value of type {other}"),
                            location,
                        );
                        Type::Int
                    }
                }
            }
            Expr::ArrayLiteral { elements, .. } => {
                let element = elements
                    .first()
                    .map(|e| self.infer(e))
                    .unwrap_or(Type::Int);
                for value in &elements[1.min(elements.len())..] {
                    self.infer(value);
                }
                Type::Array(Box::new(element), elements.len() as u32)
            }
            Expr::AddressOf { operand, location } => {
                if !Self::is_lvalue(operand) {
                    self.type_error("cannot take the address of this expression".into(), location);
                }
                self.infer(operand).pointer_to()
            }
            Expr::Dereference { operand, location } => match self.infer(operand) {
                Type::Pointer(base) => *base,
                other => {
                    self.type_error(format!("cannot dereference {other}"), location);
                    Type::Int
                }
            },
            Expr::Cast { ty, operand, location } => {
                let from = self.infer(operand);
                let to = Type::from_ref(ty);
                let ok = (from.is_numeric() || from == Type::Bool)
                    && (to.is_numeric() || to == Type::Bool)
                    || matches!(
                        (&from, &to),
                        (Type::Pointer(_), Type::Pointer(_))
                            | (Type::Int, Type::Pointer(_))
                            | (Type::Pointer(_), Type::Int)
                    );
                if !ok {
                    self.type_error(format!("cannot cast {from} to {to}"), location);
                }
                to
            }
            Expr::SizeOf { target, .. } => {
                match target {
                    SizeOfTarget::Type(ty) => {
                        if let TypeRef::Struct(name) | TypeRef::Union(name) = ty {
                            if !self.layouts.is_known(name) {
                                self.type_error(
                                    format!("unknown type '{name}' in sizeof"),
                                    expr.location(),
                                );
                            }
                        }
                    }
                    SizeOfTarget::Expr(inner) => {
                        self.infer(inner);
                    }
                }
                Type::Int
            }
            Expr::MessageSend {
                queue,
                payload,
                location,
            } => {
                let payload_ty = self.infer(payload);
                if let Some(element) = self.message_element(queue, location) {
                    if !payload_ty.convertible_to(&element) {
                        self.type_error(
                            format!("cannot send {payload_ty} into a queue of {element}"),
                            payload.location(),
                        );
                    }
                }
                Type::Void
            }
            Expr::MessageRecv {
                queue,
                timeout,
                location,
            } => {
                if let Some(timeout) = timeout {
                    let timeout_ty = self.infer(timeout);
                    if !timeout_ty.convertible_to(&Type::Int) {
                        self.type_error(
                            format!("recv timeout must be int, got {timeout_ty}"),
                            timeout.location(),
                        );
                    }
                }
                self.message_element(queue, location).unwrap_or(Type::Int)
            }
        }
    }

    fn message_element(&mut self, queue: &str, location: &Location) -> Option<Type> {
        match self.symbols.lookup(queue) {
            Some(symbol) if symbol.kind == SymbolKind::Message => Some(symbol.ty.clone()),
            Some(_) => {
                self.type_error(format!("'{queue}' is not a message queue"), location);
                None
            }
            None => {
                self.errors.push(SemanticError::Undefined {
                    name: queue.to_owned(),
                    location: location.clone(),
                });
                None
            }
        }
    }

    fn infer_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        location: &Location,
    ) -> Type {
        let lhs = self.infer(left);
        let rhs = self.infer(right);

        if op.is_logical() {
            if !lhs.is_condition() || !rhs.is_condition() {
                self.type_error(
                    format!("logical operator needs truth values, got {lhs} and {rhs}"),
                    location,
                );
            }
            return Type::Int;
        }

        if op.is_comparison() {
            let comparable = (lhs.is_numeric() || lhs == Type::Bool)
                && (rhs.is_numeric() || rhs == Type::Bool)
                || lhs == rhs;
            if !comparable {
                self.type_error(format!("cannot compare {lhs} with {rhs}"), location);
            }
            return Type::Int;
        }

        if op.is_bitwise() || op == BinaryOp::Mod {
            if !lhs.is_integer() || !rhs.is_integer() {
                self.type_error(
                    format!("operator requires integers, got {lhs} and {rhs}"),
                    location,
                );
            }
            return Type::Int;
        }

        // Remaining: + - * /
        if !lhs.is_numeric() || !rhs.is_numeric() {
            self.type_error(
                format!("arithmetic requires numeric operands, got {lhs} and {rhs}"),
                location,
            );
            return Type::Int;
        }
        lhs.common(&rhs)
    }

    fn infer_unary(&mut self, op: UnaryOp, operand: &Expr, location: &Location) -> Type {
        let ty = self.infer(operand);
        match op {
            UnaryOp::Plus | UnaryOp::Neg => {
                if !ty.is_numeric() {
                    self.type_error(format!("unary +/- needs a number, got {ty}"), location);
                    return Type::Int;
                }
                ty
            }
            UnaryOp::LogicalNot => {
                if !ty.is_condition() {
                    self.type_error(format!("'!' needs a truth value, got {ty}"), location);
                }
                Type::Int
            }
            UnaryOp::BitNot => {
                if !ty.is_integer() {
                    self.type_error(format!("'~' needs an integer, got {ty}"), location);
                }
                Type::Int
            }
            UnaryOp::PreIncrement | UnaryOp::PreDecrement => {
                if !Self::is_lvalue(operand) {
                    self.type_error("++/-- needs an assignable operand".into(), location);
                }
                if !ty.is_numeric() {
                    self.type_error(format!("++/-- needs a numeric operand, got {ty}"), location);
                }
                ty
            }
        }
    }

    fn infer_assignment(
        &mut self,
        op: AssignOp,
        target: &Expr,
        value: &Expr,
        location: &Location,
    ) -> Type {
        if !Self::is_lvalue(target) {
            self.type_error("left side of assignment is not assignable".into(), location);
        }

        if let Expr::Identifier { name, location } = target {
            if let Some(symbol) = self.symbols.lookup(name) {
                if symbol.is_const {
                    self.errors.push(SemanticError::ConstWrite {
                        name: name.clone(),
                        location: location.clone(),
                    });
                }
            }
        }

        let target_ty = self.infer(target);
        let value_ty = self.infer(value);

        if op.binary_op().is_some() {
            if !target_ty.is_numeric() || !value_ty.is_numeric() {
                self.type_error(
                    format!(
                        "compound assignment requires numbers, got {target_ty} and {value_ty}"
                    ),
                    location,
                );
            }
        } else if !value_ty.convertible_to(&target_ty) {
            self.type_error(
                format!("cannot assign {value_ty} to {target_ty}"),
                location,
            );
        }

        target_ty
    }

    fn infer_call(
        &mut self,
        callee: &str,
        arguments: &[Expr],
        location: &Location,
    ) -> Type {
        if let Some(intrinsic) = intrinsic_by_name(callee) {
            let signature = intrinsic_signature(intrinsic);
            let fixed = signature.params.len();

            let arity_ok = if signature.variadic {
                arguments.len() >= fixed
            } else {
                arguments.len() == fixed
            };
            if !arity_ok {
                self.errors.push(SemanticError::ArityMismatch {
                    name: callee.to_owned(),
                    expected: fixed,
                    found: arguments.len(),
                    location: location.clone(),
                });
            }

            for (arg, param) in arguments.iter().zip(signature.params.iter()) {
                let arg_ty = self.infer(arg);
                if !arg_ty.convertible_to(param) {
                    self.type_error(
                        format!("argument of type {arg_ty} does not fit {param}"),
                        arg.location(),
                    );
                }
            }
            for arg in arguments.iter().skip(fixed) {
                let arg_ty = self.infer(arg);
                if matches!(arg_ty, Type::Struct(_) | Type::Union(_) | Type::Void) {
                    self.type_error(
                        format!("cannot format a value of type {arg_ty}"),
                        arg.location(),
                    );
                }
            }

            return signature.return_type;
        }

        let Some(symbol) = self.symbols.lookup(callee).cloned() else {
            self.errors.push(SemanticError::Undefined {
                name: callee.to_owned(),
                location: location.clone(),
            });
            for arg in arguments {
                self.infer(arg);
            }
            return Type::Int;
        };

        let (Some(params), Some(return_type)) = (&symbol.params, &symbol.return_type)
        else {
            self.type_error(format!("'{callee}' is not a function"), location);
            return Type::Int;
        };

        if arguments.len() != params.len() {
            self.errors.push(SemanticError::ArityMismatch {
                name: callee.to_owned(),
                expected: params.len(),
                found: arguments.len(),
                location: location.clone(),
            });
        }

        for (arg, param) in arguments.iter().zip(params.iter()) {
            let arg_ty = self.infer(arg);
            if !arg_ty.convertible_to(param) {
                self.type_error(
                    format!("argument of type {arg_ty} does not fit parameter of type {param}"),
                    arg.location(),
                );
            }
        }

        return_type.clone()
    }

    fn infer_member(
        &mut self,
        object: &Expr,
        field: &str,
        via_pointer: bool,
        location: &Location,
    ) -> Type {
        let object_ty = self.infer(object);

        let aggregate = match (&object_ty, via_pointer) {
            (Type::Struct(name) | Type::Union(name), false) => name.clone(),
            (Type::Pointer(inner), true) => match inner.as_ref() {
                Type::Struct(name) | Type::Union(name) => name.clone(),
                other => {
                    self.type_error(
                        format!("'->' needs a pointer to a struct, got {other}*"),
                        location,
                    );
                    return Type::Int;
                }
            },
            (Type::Pointer(_), false) => {
                self.type_error(
                    format!("use '->' to access members through {object_ty}"),
                    location,
                );
                return Type::Int;
            }
            _ => {
                self.type_error(
                    format!("member access on non-struct value of type {object_ty}"),
                    location,
                );
                return Type::Int;
            }
        };

        match self.layouts.field_type_ref(&aggregate, field) {
            Some(ty) => Type::from_ref(&ty),
            None => {
                self.errors.push(SemanticError::UnknownField {
                    aggregate,
                    field: field.to_owned(),
                    location: location.clone(),
                });
                Type::Int
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::Lexer, parser::Parser};

    fn analyze_source(source: &str) -> Result<(), Vec<SemanticError>> {
        let tokens = Lexer::new(source, "test.rtmc").tokenize().expect("lexes");
        let program = Parser::new(tokens).parse().expect("parses");
        let mut layouts = StructLayoutTable::new();
        analyze(&program, &mut layouts)
    }

    #[test]
    fn valid_program_passes() {
        analyze_source(
            "struct P { int x; int y; };\n\
             int add(int a, int b) { return a + b; }\n\
             void main() { P p; p.x = 1; int s = add(p.x, 2); printf(\"{}\", s); }",
        )
        .expect("should pass");
    }

    #[test]
    fn undefined_identifier_is_reported() {
        let errors = analyze_source("void main() { x = 1; }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::Undefined { name, .. } if name == "x")));
    }

    #[test]
    fn const_write_is_reported() {
        let errors =
            analyze_source("void main() { const int c = 1; c = 2; }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::ConstWrite { name, .. } if name == "c")));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let errors = analyze_source(
            "int f(int a) { return a; } void main() { f(1, 2); }",
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::ArityMismatch { expected: 1, found: 2, .. })));
    }

    #[test]
    fn return_type_mismatch_is_reported() {
        let errors =
            analyze_source("void f() { return 1; } void main() { f(); }").unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn missing_main_is_reported() {
        let errors = analyze_source("int f() { return 1; }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::MissingMain)));
    }

    #[test]
    fn shadowing_is_allowed() {
        analyze_source("void main() { int x = 1; { int x = 2; x = 3; } x = 4; }")
            .expect("shadowing should pass");
    }

    #[test]
    fn redefinition_in_same_scope_fails() {
        let errors = analyze_source("void main() { int x = 1; int x = 2; }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::Redefinition { name, .. } if name == "x")));
    }

    #[test]
    fn mod_requires_integers() {
        let errors = analyze_source("void main() { float f = 1.5; int x = f % 2; }")
            .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn unknown_field_is_reported() {
        let errors = analyze_source(
            "struct P { int x; }; void main() { P p; p.z = 1; }",
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::UnknownField { field, .. } if field == "z")));
    }

    #[test]
    fn arrow_on_value_is_rejected() {
        let errors = analyze_source(
            "struct P { int x; }; void main() { P p; p->x = 1; }",
        )
        .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn message_payload_type_is_checked() {
        let errors = analyze_source(
            "struct P { int x; };\nmessage<int> Q;\n\
             void main() { P p; Q.send(p); }",
        )
        .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn recv_timeout_must_be_int() {
        let errors = analyze_source(
            "message<int> Q; void main() { int x = Q.recv(\"soon\"); }",
        )
        .unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn intrinsics_are_type_checked() {
        analyze_source("void main() { HW_GPIO_INIT(13, 1); HW_GPIO_SET(13, 1); }")
            .expect("gpio calls pass");
        let errors =
            analyze_source("void main() { HW_GPIO_INIT(13); }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::ArityMismatch { .. })));
    }

    #[test]
    fn start_task_takes_function_pointer() {
        analyze_source(
            "void worker() { }\n\
             void main() { StartTask(1024, 0, 5, 1, worker); }",
        )
        .expect("StartTask with a function name passes");
    }

    #[test]
    fn inherited_fields_resolve() {
        analyze_source(
            "struct B { int x; }; struct D : B { int y; };\n\
             void main() { D d; d.x = 1; d.y = 2; }",
        )
        .expect("base fields visible on derived");
    }
}
