//! AST-level optimization: constant folding, then dead-code elimination.
//!
//! Both passes preserve semantics. Constant division or modulo by zero is
//! reported as a warning and the expression is left un-folded so the VM's
//! runtime error fires where the user wrote it. Declarations, message
//! operations and calls are treated as effectful and never removed.

use std::collections::HashMap;

use crate::{
    ast::*,
    layout::StructLayoutTable,
};

/// Run both passes and return the optimized program plus any warnings.
pub struct Optimizer<'a> {
    layouts: &'a mut StructLayoutTable,
    warnings: Vec<String>,
    /// Values of `const` locals whose initializer folded to a literal, one
    /// map per live scope.
    const_scopes: Vec<HashMap<String, LiteralValue>>,
}

impl<'a> Optimizer<'a> {
    pub fn new(layouts: &'a mut StructLayoutTable) -> Self {
        Self {
            layouts,
            warnings: Vec::new(),
            const_scopes: vec![HashMap::new()],
        }
    }

    /// Optimize a whole program.
    pub fn optimize(mut self, program: Program) -> (Program, Vec<String>) {
        let folded = Program {
            declarations: program
                .declarations
                .into_iter()
                .map(|d| self.fold_decl(d))
                .collect(),
        };

        let eliminated = Program {
            declarations: folded
                .declarations
                .into_iter()
                .map(eliminate_decl)
                .collect(),
        };

        for warning in &self.warnings {
            tracing::warn!("{warning}");
        }
        (eliminated, self.warnings)
    }

    // ---- constant folding ----------------------------------------------

    fn lookup_const(&self, name: &str) -> Option<&LiteralValue> {
        self.const_scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn forget(&mut self, name: &str) {
        for scope in self.const_scopes.iter_mut().rev() {
            scope.remove(name);
        }
    }

    fn fold_decl(&mut self, decl: Decl) -> Decl {
        match decl {
            Decl::Function(mut f) => {
                self.const_scopes.push(HashMap::new());
                f.body = self.fold_block(f.body);
                self.const_scopes.pop();
                Decl::Function(f)
            }
            Decl::Variable(mut v) => {
                v.initializer = v.initializer.take().map(|e| self.fold_expr(e));
                if v.is_const {
                    if let Some(Expr::Literal { value, .. }) = &v.initializer {
                        self.const_scopes
                            .last_mut()
                            .expect("scope stack is never empty")
                            .insert(v.name.clone(), value.clone());
                    }
                } else {
                    self.forget(&v.name);
                }
                Decl::Variable(v)
            }
            Decl::Array(mut a) => {
                a.size = Box::new(self.fold_expr(*a.size));
                a.initializer = a.initializer.take().map(|e| self.fold_expr(e));
                Decl::Array(a)
            }
            other => other,
        }
    }

    fn fold_block(&mut self, block: Block) -> Block {
        self.const_scopes.push(HashMap::new());
        let statements = block
            .statements
            .into_iter()
            .map(|s| self.fold_stmt(s))
            .collect();
        self.const_scopes.pop();
        Block {
            statements,
            location: block.location,
        }
    }

    fn fold_stmt(&mut self, stmt: Stmt) -> Stmt {
        match stmt {
            Stmt::Block(block) => Stmt::Block(self.fold_block(block)),
            Stmt::Expr(expr) => Stmt::Expr(self.fold_expr(expr)),
            Stmt::Declaration(decl) => Stmt::Declaration(self.fold_decl(decl)),
            Stmt::If {
                condition,
                then_branch,
                else_branch,
                location,
            } => Stmt::If {
                condition: self.fold_expr(condition),
                then_branch: Box::new(self.fold_stmt(*then_branch)),
                else_branch: else_branch.map(|e| Box::new(self.fold_stmt(*e))),
                location,
            },
            Stmt::While {
                condition,
                body,
                location,
            } => Stmt::While {
                condition: self.fold_expr(condition),
                body: Box::new(self.fold_stmt(*body)),
                location,
            },
            Stmt::For {
                init,
                condition,
                update,
                body,
                location,
            } => Stmt::For {
                init: init.map(|s| Box::new(self.fold_stmt(*s))),
                condition: condition.map(|e| self.fold_expr(e)),
                update: update.map(|e| self.fold_expr(e)),
                body: Box::new(self.fold_stmt(*body)),
                location,
            },
            Stmt::Return { value, location } => Stmt::Return {
                value: value.map(|e| self.fold_expr(e)),
                location,
            },
            other => other,
        }
    }

    fn fold_expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::Identifier { ref name, ref location } => {
                if let Some(value) = self.lookup_const(name) {
                    Expr::Literal {
                        value: value.clone(),
                        location: location.clone(),
                    }
                } else {
                    expr
                }
            }
            Expr::Binary {
                op,
                left,
                right,
                location,
            } => {
                let left = self.fold_expr(*left);
                let right = self.fold_expr(*right);

                if let (
                    Expr::Literal { value: a, .. },
                    Expr::Literal { value: b, .. },
                ) = (&left, &right)
                {
                    match eval_binary(op, a, b) {
                        FoldOutcome::Value(value) => {
                            return Expr::Literal { value, location }
                        }
                        FoldOutcome::DivisionByZero => {
                            self.warnings.push(format!(
                                "{location}: constant {} by zero is not folded",
                                if op == BinaryOp::Div { "division" } else { "modulo" },
                            ));
                        }
                        FoldOutcome::NotFoldable => {}
                    }
                }

                if let Some(simplified) = simplify(op, &left, &right) {
                    return simplified;
                }

                Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                    location,
                }
            }
            Expr::Unary {
                op,
                operand,
                location,
            } => {
                let operand = self.fold_expr(*operand);
                if let Expr::Literal { value, .. } = &operand {
                    if let Some(folded) = eval_unary(op, value) {
                        return Expr::Literal {
                            value: folded,
                            location,
                        };
                    }
                }
                Expr::Unary {
                    op,
                    operand: Box::new(operand),
                    location,
                }
            }
            Expr::Postfix { op, operand, location } => {
                if let Expr::Identifier { name, .. } = operand.as_ref() {
                    self.forget(&name.clone());
                }
                Expr::Postfix { op, operand, location }
            }
            Expr::Assignment {
                op,
                target,
                value,
                location,
            } => {
                if let Expr::Identifier { name, .. } = target.as_ref() {
                    self.forget(&name.clone());
                }
                let target = self.fold_lvalue(*target);
                let value = self.fold_expr(*value);
                Expr::Assignment {
                    op,
                    target: Box::new(target),
                    value: Box::new(value),
                    location,
                }
            }
            Expr::Call {
                callee,
                arguments,
                location,
            } => Expr::Call {
                callee,
                arguments: arguments.into_iter().map(|a| self.fold_expr(a)).collect(),
                location,
            },
            Expr::Member { .. } => expr,
            Expr::ArrayAccess {
                array,
                index,
                location,
            } => Expr::ArrayAccess {
                array,
                index: Box::new(self.fold_expr(*index)),
                location,
            },
            Expr::ArrayLiteral { elements, location } => Expr::ArrayLiteral {
                elements: elements.into_iter().map(|e| self.fold_expr(e)).collect(),
                location,
            },
            Expr::Cast { ty, operand, location } => Expr::Cast {
                ty,
                operand: Box::new(self.fold_expr(*operand)),
                location,
            },
            Expr::SizeOf { ref target, ref location } => match target {
                SizeOfTarget::Type(ty) => match self.layouts.size_of_type(ty) {
                    Ok(size) => Expr::Literal {
                        value: LiteralValue::Int(i64::from(size)),
                        location: location.clone(),
                    },
                    Err(_) => expr,
                },
                SizeOfTarget::Expr(inner) => match inner.as_ref() {
                    Expr::Literal { value, .. } => {
                        let size = match value {
                            LiteralValue::Int(_) => 4,
                            LiteralValue::Float(_) => 4,
                            LiteralValue::Char(_) | LiteralValue::Bool(_) => 1,
                            LiteralValue::Str(s) => s.len() as i64 + 1,
                        };
                        Expr::Literal {
                            value: LiteralValue::Int(size),
                            location: location.clone(),
                        }
                    }
                    _ => expr,
                },
            },
            Expr::MessageSend {
                queue,
                payload,
                location,
            } => Expr::MessageSend {
                queue,
                payload: Box::new(self.fold_expr(*payload)),
                location,
            },
            Expr::MessageRecv {
                queue,
                timeout,
                location,
            } => Expr::MessageRecv {
                queue,
                timeout: timeout.map(|t| Box::new(self.fold_expr(*t))),
                location,
            },
            other => other,
        }
    }

    /// Fold inside an assignment target without const-propagating the
    /// target itself away.
    fn fold_lvalue(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::ArrayAccess {
                array,
                index,
                location,
            } => Expr::ArrayAccess {
                array,
                index: Box::new(self.fold_expr(*index)),
                location,
            },
            Expr::Dereference { operand, location } => Expr::Dereference {
                operand: Box::new(self.fold_expr(*operand)),
                location,
            },
            other => other,
        }
    }
}

enum FoldOutcome {
    Value(LiteralValue),
    DivisionByZero,
    NotFoldable,
}

fn as_f32(value: &LiteralValue) -> Option<f32> {
    Some(match value {
        LiteralValue::Int(v) => *v as f32,
        LiteralValue::Float(v) => *v,
        LiteralValue::Char(c) => *c as u32 as f32,
        LiteralValue::Bool(b) => u8::from(*b) as f32,
        LiteralValue::Str(_) => return None,
    })
}

fn as_i64(value: &LiteralValue) -> Option<i64> {
    Some(match value {
        LiteralValue::Int(v) => *v,
        LiteralValue::Char(c) => i64::from(*c as u32),
        LiteralValue::Bool(b) => i64::from(*b),
        LiteralValue::Float(_) | LiteralValue::Str(_) => return None,
    })
}

fn is_float(value: &LiteralValue) -> bool {
    matches!(value, LiteralValue::Float(_))
}

fn truthy(value: &LiteralValue) -> bool {
    match value {
        LiteralValue::Int(v) => *v != 0,
        LiteralValue::Float(v) => *v != 0.0,
        LiteralValue::Char(c) => *c != '\0',
        LiteralValue::Bool(b) => *b,
        LiteralValue::Str(_) => true,
    }
}

fn eval_binary(op: BinaryOp, a: &LiteralValue, b: &LiteralValue) -> FoldOutcome {
    use BinaryOp::*;
    use FoldOutcome::*;

    if op.is_logical() {
        let value = match op {
            LogicalAnd => truthy(a) && truthy(b),
            _ => truthy(a) || truthy(b),
        };
        return Value(LiteralValue::Int(i64::from(value)));
    }

    if matches!(a, LiteralValue::Str(_)) || matches!(b, LiteralValue::Str(_)) {
        return NotFoldable;
    }

    if op.is_comparison() {
        // Integer pairs compare exactly; anything involving a float
        // promotes, as the VM does.
        let ordering = match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (Some(x), Some(y)) = (as_f32(a), as_f32(b)) else {
                    return NotFoldable;
                };
                match x.partial_cmp(&y) {
                    Some(ordering) => ordering,
                    None => return NotFoldable,
                }
            }
        };
        use core::cmp::Ordering;
        let value = match op {
            Eq => ordering == Ordering::Equal,
            Neq => ordering != Ordering::Equal,
            Lt => ordering == Ordering::Less,
            Lte => ordering != Ordering::Greater,
            Gt => ordering == Ordering::Greater,
            _ => ordering != Ordering::Less,
        };
        return Value(LiteralValue::Int(i64::from(value)));
    }

    if op.is_bitwise() || op == Mod {
        let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) else {
            return NotFoldable;
        };
        let value = match op {
            BitAnd => x & y,
            BitOr => x | y,
            BitXor => x ^ y,
            Shl => x.wrapping_shl(y as u32),
            Shr => x.wrapping_shr(y as u32),
            _ => {
                if y == 0 {
                    return DivisionByZero;
                }
                // Matches the VM's euclidean remainder.
                x.rem_euclid(y)
            }
        };
        return Value(LiteralValue::Int(value));
    }

    // + - * /
    if is_float(a) || is_float(b) {
        let (Some(x), Some(y)) = (as_f32(a), as_f32(b)) else {
            return NotFoldable;
        };
        let value = match op {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            _ => {
                if y == 0.0 {
                    return DivisionByZero;
                }
                x / y
            }
        };
        return Value(LiteralValue::Float(value));
    }

    let (Some(x), Some(y)) = (as_i64(a), as_i64(b)) else {
        return NotFoldable;
    };
    let value = match op {
        Add => x.wrapping_add(y),
        Sub => x.wrapping_sub(y),
        Mul => x.wrapping_mul(y),
        _ => {
            if y == 0 {
                return DivisionByZero;
            }
            x / y
        }
    };
    Value(LiteralValue::Int(value))
}

fn eval_unary(op: UnaryOp, value: &LiteralValue) -> Option<LiteralValue> {
    Some(match op {
        UnaryOp::Plus => value.clone(),
        UnaryOp::Neg => match value {
            LiteralValue::Int(v) => LiteralValue::Int(-v),
            LiteralValue::Float(v) => LiteralValue::Float(-v),
            _ => return None,
        },
        UnaryOp::LogicalNot => LiteralValue::Int(i64::from(!truthy(value))),
        UnaryOp::BitNot => LiteralValue::Int(!as_i64(value)? & 0xFFFF_FFFF),
        UnaryOp::PreIncrement | UnaryOp::PreDecrement => return None,
    })
}

/// Whether an expression may be dropped without losing effects.
fn is_pure(expr: &Expr) -> bool {
    matches!(expr, Expr::Literal { .. } | Expr::Identifier { .. })
}

fn literal_int(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Literal { value, .. } => as_i64(value),
        _ => None,
    }
}

/// Algebraic identities: `x+0`, `x-0`, `x*0`, `x*1`, `x/1`.
fn simplify(op: BinaryOp, left: &Expr, right: &Expr) -> Option<Expr> {
    match op {
        BinaryOp::Add => {
            if literal_int(right) == Some(0) {
                return Some(left.clone());
            }
            if literal_int(left) == Some(0) {
                return Some(right.clone());
            }
        }
        BinaryOp::Sub => {
            if literal_int(right) == Some(0) {
                return Some(left.clone());
            }
        }
        BinaryOp::Mul => {
            // x*0 erases x, so x must have no effects.
            if literal_int(right) == Some(0) && is_pure(left) {
                return Some(right.clone());
            }
            if literal_int(left) == Some(0) && is_pure(right) {
                return Some(left.clone());
            }
            if literal_int(right) == Some(1) {
                return Some(left.clone());
            }
            if literal_int(left) == Some(1) {
                return Some(right.clone());
            }
        }
        BinaryOp::Div => {
            if literal_int(right) == Some(1) {
                return Some(left.clone());
            }
        }
        _ => {}
    }
    None
}

// ---- dead-code elimination ---------------------------------------------

fn eliminate_decl(decl: Decl) -> Decl {
    match decl {
        Decl::Function(mut f) => {
            f.body = eliminate_block(f.body);
            Decl::Function(f)
        }
        other => other,
    }
}

fn is_terminator(stmt: &Stmt) -> bool {
    matches!(
        stmt,
        Stmt::Return { .. } | Stmt::Break { .. } | Stmt::Continue { .. }
    )
}

fn eliminate_block(block: Block) -> Block {
    let mut statements = Vec::new();
    for stmt in block.statements {
        let Some(stmt) = eliminate_stmt(stmt) else {
            continue;
        };
        let ends = is_terminator(&stmt);
        statements.push(stmt);
        if ends {
            break;
        }
    }
    Block {
        statements,
        location: block.location,
    }
}

fn eliminate_stmt(stmt: Stmt) -> Option<Stmt> {
    match stmt {
        Stmt::Block(block) => Some(Stmt::Block(eliminate_block(block))),
        Stmt::If {
            condition,
            then_branch,
            else_branch,
            location,
        } => {
            if let Expr::Literal { value, .. } = &condition {
                return if truthy(value) {
                    eliminate_stmt(*then_branch)
                } else {
                    else_branch.and_then(|e| eliminate_stmt(*e))
                };
            }
            Some(Stmt::If {
                condition,
                then_branch: Box::new(eliminate_stmt(*then_branch).unwrap_or_else(empty_block)),
                else_branch: else_branch
                    .and_then(|e| eliminate_stmt(*e))
                    .map(Box::new),
                location,
            })
        }
        Stmt::While {
            condition,
            body,
            location,
        } => {
            if let Expr::Literal { value, .. } = &condition {
                if !truthy(value) {
                    return None;
                }
            }
            Some(Stmt::While {
                condition,
                body: Box::new(eliminate_stmt(*body).unwrap_or_else(empty_block)),
                location,
            })
        }
        Stmt::For {
            init,
            condition,
            update,
            body,
            location,
        } => Some(Stmt::For {
            init,
            condition,
            update,
            body: Box::new(eliminate_stmt(*body).unwrap_or_else(empty_block)),
            location,
        }),
        other => Some(other),
    }
}

fn empty_block() -> Stmt {
    Stmt::Block(Block {
        statements: Vec::new(),
        location: crate::source::Location::unknown(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::Lexer, parser::Parser};

    fn optimize_source(source: &str) -> (Program, Vec<String>) {
        let tokens = Lexer::new(source, "test.rtmc").tokenize().expect("lexes");
        let program = Parser::new(tokens).parse().expect("parses");
        let mut layouts = StructLayoutTable::new();
        for decl in &program.declarations {
            match decl {
                Decl::Struct(s) => layouts.register_struct(s),
                Decl::Union(u) => layouts.register_union(u),
                _ => {}
            }
        }
        Optimizer::new(&mut layouts).optimize(program)
    }

    fn main_body(program: &Program) -> &Block {
        for decl in &program.declarations {
            if let Decl::Function(f) = decl {
                if f.name == "main" {
                    return &f.body;
                }
            }
        }
        panic!("no main");
    }

    fn init_of(stmt: &Stmt) -> &Expr {
        let Stmt::Declaration(Decl::Variable(v)) = stmt else {
            panic!("expected variable declaration, got {stmt:?}");
        };
        v.initializer.as_ref().expect("initializer")
    }

    #[test]
    fn arithmetic_folds() {
        let (program, warnings) = optimize_source("void main() { int x = 2 + 3 * 4; }");
        assert!(warnings.is_empty());
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[0]),
            Expr::Literal { value: LiteralValue::Int(14), .. }
        ));
    }

    #[test]
    fn division_by_zero_warns_and_keeps_expression() {
        let (program, warnings) = optimize_source("void main() { int x = 1 / 0; }");
        assert_eq!(warnings.len(), 1);
        let body = main_body(&program);
        assert!(matches!(init_of(&body.statements[0]), Expr::Binary { .. }));
    }

    #[test]
    fn algebraic_identities() {
        let (program, _) =
            optimize_source("void main() { int a = 1; int x = a + 0; int y = a * 1; int z = a * 0; }");
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[1]),
            Expr::Identifier { .. }
        ));
        assert!(matches!(
            init_of(&body.statements[2]),
            Expr::Identifier { .. }
        ));
        assert!(matches!(
            init_of(&body.statements[3]),
            Expr::Literal { value: LiteralValue::Int(0), .. }
        ));
    }

    #[test]
    fn const_locals_propagate() {
        let (program, _) =
            optimize_source("void main() { const int n = 6; int x = n * 7; }");
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[1]),
            Expr::Literal { value: LiteralValue::Int(42), .. }
        ));
    }

    #[test]
    fn sizeof_folds_with_layouts() {
        let (program, _) = optimize_source(
            "struct P { int x; int y; }; void main() { int s = sizeof(struct P); int i = sizeof(int); }",
        );
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[0]),
            Expr::Literal { value: LiteralValue::Int(8), .. }
        ));
        assert!(matches!(
            init_of(&body.statements[1]),
            Expr::Literal { value: LiteralValue::Int(4), .. }
        ));
    }

    #[test]
    fn code_after_return_is_dropped() {
        let (program, _) =
            optimize_source("void main() { return; int x = 1; }");
        let body = main_body(&program);
        assert_eq!(body.statements.len(), 1);
    }

    #[test]
    fn constant_if_selects_branch() {
        let (program, _) = optimize_source(
            "void main() { if (1) { int a = 1; } else { int b = 2; } if (0) { int c = 3; } }",
        );
        let body = main_body(&program);
        // The false `if` disappeared entirely; the true one left its branch.
        assert_eq!(body.statements.len(), 1);
        assert!(matches!(body.statements[0], Stmt::Block(_)));
    }

    #[test]
    fn constant_false_while_is_removed() {
        let (program, _) = optimize_source("void main() { while (0) { int a = 1; } }");
        assert!(main_body(&program).statements.is_empty());
    }

    #[test]
    fn calls_are_never_removed() {
        let (program, _) = optimize_source(
            "int f() { return 1; } void main() { f(); 1 + 2; }",
        );
        let body = main_body(&program);
        assert!(matches!(&body.statements[0], Stmt::Expr(Expr::Call { .. })));
    }

    #[test]
    fn comparisons_and_logical_fold() {
        let (program, _) =
            optimize_source("void main() { int x = 3 < 5 && 2 == 2; int y = !0; }");
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[0]),
            Expr::Literal { value: LiteralValue::Int(1), .. }
        ));
        assert!(matches!(
            init_of(&body.statements[1]),
            Expr::Literal { value: LiteralValue::Int(1), .. }
        ));
    }

    #[test]
    fn float_arithmetic_folds() {
        let (program, _) = optimize_source("void main() { float f = 1.5 * 2.0; }");
        let body = main_body(&program);
        let Expr::Literal { value: LiteralValue::Float(v), .. } =
            init_of(&body.statements[0])
        else {
            panic!("expected folded float");
        };
        assert_eq!(*v, 3.0);
    }

    #[test]
    fn assignment_invalidates_known_consts() {
        // A shadowed non-const write must stop propagation of the inner name.
        let (program, _) = optimize_source(
            "void main() { int n = 1; n = 2; int x = n + 0; }",
        );
        let body = main_body(&program);
        assert!(matches!(
            init_of(&body.statements[2]),
            Expr::Identifier { .. }
        ));
    }
}
