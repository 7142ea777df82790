//! Recursive-descent parser.
//!
//! Declarations are distinguished by lookahead: `type IDENT '('` is a
//! function, `type IDENT '['` an array, `struct IDENT '{'` an aggregate and
//! so on. Syntax errors are collected rather than fatal: the parser
//! synchronizes to the next semicolon or declaration keyword and keeps
//! going, reporting the whole list at the end.

use std::collections::HashSet;

use crate::{
    ast::*,
    lexer::{Token, TokenKind},
    source::Location,
};

/// A positioned syntax error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("{location}: expected {expected}, found '{found}'")]
    Expected {
        expected: String,
        found: String,
        location: Location,
    },
    #[error("{location}: {message}")]
    Invalid { message: String, location: Location },
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
    union_groups: u32,
    /// Aggregate names seen so far; lets `Point p;` parse as a declaration.
    aggregates: HashSet<String>,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
            union_groups: 0,
            aggregates: HashSet::new(),
        }
    }

    /// Parse a whole compilation unit, reporting every collected error.
    pub fn parse(mut self) -> Result<Program, Vec<ParseError>> {
        let mut declarations = Vec::new();

        while !self.check(TokenKind::Eof) {
            match self.parse_declaration() {
                Ok(decl) => declarations.push(decl),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }

        if self.errors.is_empty() {
            Ok(Program { declarations })
        } else {
            Err(self.errors)
        }
    }

    // ---- token plumbing -------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        let found = if token.kind == TokenKind::Eof {
            "end of file".to_owned()
        } else {
            token.lexeme.clone()
        };
        ParseError::Expected {
            expected: expected.to_owned(),
            found,
            location: token.location(),
        }
    }

    fn location(&self) -> Location {
        self.peek().location()
    }

    /// Skip to the next statement or declaration boundary after an error.
    fn synchronize(&mut self) {
        while !self.check(TokenKind::Eof) {
            if self.eat(TokenKind::Semicolon) {
                return;
            }
            match self.peek().kind {
                TokenKind::Struct
                | TokenKind::Union
                | TokenKind::Message
                | TokenKind::Include
                | TokenKind::Const
                | TokenKind::Int
                | TokenKind::FloatType
                | TokenKind::CharType
                | TokenKind::BoolType
                | TokenKind::Void
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::RBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn starts_type(&self, kind: TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Int
                | TokenKind::FloatType
                | TokenKind::CharType
                | TokenKind::BoolType
                | TokenKind::Void
                | TokenKind::Struct
                | TokenKind::Union
        )
    }

    // ---- declarations ---------------------------------------------------

    fn parse_declaration(&mut self) -> PResult<Decl> {
        match self.peek().kind {
            TokenKind::Include => self.parse_include(),
            TokenKind::Message => self.parse_message(),
            TokenKind::Struct if self.peek_at(1).kind == TokenKind::Identifier
                && matches!(
                    self.peek_at(2).kind,
                    TokenKind::LBrace | TokenKind::Colon
                ) =>
            {
                self.parse_struct()
            }
            TokenKind::Union if self.peek_at(1).kind == TokenKind::Identifier
                && self.peek_at(2).kind == TokenKind::LBrace =>
            {
                self.parse_union()
            }
            _ => self.parse_typed_declaration(),
        }
    }

    fn parse_include(&mut self) -> PResult<Decl> {
        let location = self.location();
        self.advance(); // include / import
        let path = self.expect(TokenKind::Str, "include path string")?;
        self.eat(TokenKind::Semicolon);
        Ok(Decl::Include(IncludeDecl {
            path: path.lexeme,
            location,
        }))
    }

    fn parse_message(&mut self) -> PResult<Decl> {
        let location = self.location();
        self.advance(); // message
        self.expect(TokenKind::Less, "'<'")?;
        let element_type = self.parse_type()?;
        self.expect(TokenKind::Greater, "'>'")?;
        let name = self.expect(TokenKind::Identifier, "queue name")?;
        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Decl::Message(MessageDecl {
            name: name.lexeme,
            element_type,
            location,
        }))
    }

    fn parse_struct(&mut self) -> PResult<Decl> {
        let location = self.location();
        self.advance(); // struct
        let name = self.expect(TokenKind::Identifier, "struct name")?.lexeme;

        let base = if self.eat(TokenKind::Colon) {
            Some(self.expect(TokenKind::Identifier, "base struct name")?.lexeme)
        } else {
            None
        };

        self.expect(TokenKind::LBrace, "'{'")?;
        let fields = self.parse_field_list()?;
        self.expect(TokenKind::RBrace, "'}'")?;
        self.eat(TokenKind::Semicolon);

        self.aggregates.insert(name.clone());
        Ok(Decl::Struct(StructDecl {
            name,
            base,
            fields,
            location,
        }))
    }

    fn parse_union(&mut self) -> PResult<Decl> {
        let location = self.location();
        self.advance(); // union
        let name = self.expect(TokenKind::Identifier, "union name")?.lexeme;
        self.expect(TokenKind::LBrace, "'{'")?;
        let fields = self.parse_field_list()?;
        self.expect(TokenKind::RBrace, "'}'")?;
        self.eat(TokenKind::Semicolon);

        self.aggregates.insert(name.clone());
        Ok(Decl::Union(UnionDecl {
            name,
            fields,
            location,
        }))
    }

    fn parse_field_list(&mut self) -> PResult<Vec<Field>> {
        let mut fields = Vec::new();

        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            // Anonymous aggregates nest inside struct/union bodies.
            if self.check(TokenKind::Union) && self.peek_at(1).kind == TokenKind::LBrace {
                self.advance();
                self.advance();
                self.union_groups += 1;
                let group = self.union_groups;
                let inner = self.parse_field_list()?;
                self.expect(TokenKind::RBrace, "'}'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                for mut field in inner {
                    field.union_group = Some(group);
                    fields.push(field);
                }
                continue;
            }
            if self.check(TokenKind::Struct) && self.peek_at(1).kind == TokenKind::LBrace
            {
                self.advance();
                self.advance();
                let inner = self.parse_field_list()?;
                self.expect(TokenKind::RBrace, "'}'")?;
                self.expect(TokenKind::Semicolon, "';'")?;
                fields.extend(inner);
                continue;
            }

            fields.push(self.parse_field()?);
        }

        Ok(fields)
    }

    fn parse_field(&mut self) -> PResult<Field> {
        let location = self.location();
        let ty = self.parse_type()?;
        let name = self.expect(TokenKind::Identifier, "field name")?.lexeme;

        // Array field: `char b[4];`
        if self.eat(TokenKind::LBracket) {
            let size_token = self.expect(TokenKind::Integer, "array size")?;
            let size = size_token.int_value().ok_or_else(|| ParseError::Invalid {
                message: format!("invalid array size '{}'", size_token.lexeme),
                location: size_token.location(),
            })?;
            self.expect(TokenKind::RBracket, "']'")?;
            self.expect(TokenKind::Semicolon, "';'")?;
            return Ok(Field {
                name,
                ty: TypeRef::Array {
                    element: Box::new(ty),
                    size: Some(size as u32),
                },
                bit_width: None,
                default: None,
                union_group: None,
                location,
            });
        }

        let bit_width = if self.eat(TokenKind::Colon) {
            let width = self.expect(TokenKind::Integer, "bit width")?;
            Some(width.int_value().unwrap_or(0) as u32)
        } else {
            None
        };

        let default = if self.eat(TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };

        self.expect(TokenKind::Semicolon, "';'")?;
        Ok(Field {
            name,
            ty,
            bit_width,
            default,
            union_group: None,
            location,
        })
    }

    /// Declarations led by a type specifier: functions, variables, arrays.
    fn parse_typed_declaration(&mut self) -> PResult<Decl> {
        let location = self.location();
        let is_const = self.eat(TokenKind::Const);
        let ty = self.parse_type()?;
        let name = self.expect(TokenKind::Identifier, "name")?.lexeme;

        match self.peek().kind {
            TokenKind::LParen => self.parse_function(ty, name, location),
            TokenKind::LBracket => self.parse_array_decl(ty, name, location),
            _ => {
                let initializer = if self.eat(TokenKind::Assign) {
                    Some(self.parse_initializer()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Decl::Variable(VariableDecl {
                    name,
                    ty,
                    is_const,
                    initializer,
                    location,
                }))
            }
        }
    }

    fn parse_function(
        &mut self,
        return_type: TypeRef,
        name: String,
        location: Location,
    ) -> PResult<Decl> {
        self.expect(TokenKind::LParen, "'('")?;

        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let param_location = self.location();
                let ty = self.parse_type()?;
                let param_name = self.expect(TokenKind::Identifier, "parameter name")?;
                params.push(Param {
                    name: param_name.lexeme,
                    ty,
                    location: param_location,
                });
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;

        let body = self.parse_block()?;
        Ok(Decl::Function(FunctionDecl {
            name,
            return_type,
            params,
            body,
            location,
        }))
    }

    fn parse_array_decl(
        &mut self,
        element_type: TypeRef,
        name: String,
        location: Location,
    ) -> PResult<Decl> {
        self.expect(TokenKind::LBracket, "'['")?;
        let size = self.parse_expr()?;
        self.expect(TokenKind::RBracket, "']'")?;

        let initializer = if self.eat(TokenKind::Assign) {
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "';'")?;

        Ok(Decl::Array(ArrayDecl {
            name,
            element_type,
            size: Box::new(size),
            initializer,
            location,
        }))
    }

    fn parse_type(&mut self) -> PResult<TypeRef> {
        let base = match self.peek().kind {
            TokenKind::Int => {
                self.advance();
                TypeRef::Primitive(Primitive::Int)
            }
            TokenKind::FloatType => {
                self.advance();
                TypeRef::Primitive(Primitive::Float)
            }
            TokenKind::CharType => {
                self.advance();
                TypeRef::Primitive(Primitive::Char)
            }
            TokenKind::BoolType => {
                self.advance();
                TypeRef::Primitive(Primitive::Bool)
            }
            TokenKind::Void => {
                self.advance();
                TypeRef::Primitive(Primitive::Void)
            }
            TokenKind::Struct => {
                self.advance();
                let name = self.expect(TokenKind::Identifier, "struct name")?;
                TypeRef::Struct(name.lexeme)
            }
            TokenKind::Union => {
                self.advance();
                let name = self.expect(TokenKind::Identifier, "union name")?;
                TypeRef::Union(name.lexeme)
            }
            TokenKind::Identifier => {
                let name = self.advance();
                TypeRef::Struct(name.lexeme)
            }
            _ => return Err(self.unexpected("type")),
        };

        let mut level = 0u8;
        while self.check(TokenKind::Star) {
            self.advance();
            level += 1;
        }

        if level > 0 {
            Ok(TypeRef::Pointer {
                base: Box::new(base),
                level,
            })
        } else {
            Ok(base)
        }
    }

    // ---- statements -----------------------------------------------------

    fn parse_block(&mut self) -> PResult<Block> {
        let location = self.location();
        self.expect(TokenKind::LBrace, "'{'")?;

        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;

        Ok(Block {
            statements,
            location,
        })
    }

    fn statement_is_declaration(&self) -> bool {
        let kind = self.peek().kind;
        if matches!(kind, TokenKind::Const | TokenKind::Message) || self.starts_type(kind)
        {
            return true;
        }
        // `Point p ...` / `Point* p ...` where Point is a known aggregate,
        // or any `IDENT IDENT` pair, which no expression can produce.
        if kind == TokenKind::Identifier {
            let next = self.peek_at(1).kind;
            if next == TokenKind::Identifier {
                return true;
            }
            if next == TokenKind::Star
                && self.aggregates.contains(&self.peek().lexeme)
                && self.peek_at(2).kind == TokenKind::Identifier
            {
                return true;
            }
        }
        false
    }

    fn parse_statement(&mut self) -> PResult<Stmt> {
        match self.peek().kind {
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => {
                let location = self.location();
                self.advance();
                let value = if self.check(TokenKind::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Return { value, location })
            }
            TokenKind::Break => {
                let location = self.location();
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Break { location })
            }
            TokenKind::Continue => {
                let location = self.location();
                self.advance();
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Continue { location })
            }
            TokenKind::Message => Ok(Stmt::Declaration(self.parse_message()?)),
            _ if self.statement_is_declaration() => {
                Ok(Stmt::Declaration(self.parse_typed_declaration()?))
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let location = self.location();
        self.advance(); // if
        self.expect(TokenKind::LParen, "'('")?;
        let condition = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.eat(TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
            location,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let location = self.location();
        self.advance(); // while
        self.expect(TokenKind::LParen, "'('")?;
        let condition = self.parse_expr()?;
        self.expect(TokenKind::RParen, "')'")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While {
            condition,
            body,
            location,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let location = self.location();
        self.advance(); // for
        self.expect(TokenKind::LParen, "'('")?;

        let init = if self.eat(TokenKind::Semicolon) {
            None
        } else if self.statement_is_declaration() {
            Some(Box::new(Stmt::Declaration(self.parse_typed_declaration()?)))
        } else {
            let expr = self.parse_expr()?;
            self.expect(TokenKind::Semicolon, "';'")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let condition = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::Semicolon, "';'")?;

        let update = if self.check(TokenKind::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::RParen, "')'")?;

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            condition,
            update,
            body,
            location,
        })
    }

    // ---- expressions ----------------------------------------------------

    fn parse_initializer(&mut self) -> PResult<Expr> {
        if self.check(TokenKind::LBrace) {
            let location = self.location();
            self.advance();
            let mut elements = Vec::new();
            if !self.check(TokenKind::RBrace) {
                loop {
                    elements.push(self.parse_expr()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RBrace, "'}'")?;
            Ok(Expr::ArrayLiteral { elements, location })
        } else {
            self.parse_expr()
        }
    }

    pub(crate) fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> PResult<Expr> {
        let expr = self.parse_binary(0)?;

        let op = match self.peek().kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::AddAssign,
            TokenKind::MinusAssign => AssignOp::SubAssign,
            TokenKind::StarAssign => AssignOp::MulAssign,
            TokenKind::SlashAssign => AssignOp::DivAssign,
            _ => return Ok(expr),
        };
        let location = self.location();
        self.advance();
        let value = self.parse_assignment()?;
        Ok(Expr::Assignment {
            op,
            target: Box::new(expr),
            value: Box::new(value),
            location,
        })
    }

    /// Binary operator precedence, loosest first.
    fn binary_op_at(&self, level: u8) -> Option<BinaryOp> {
        use TokenKind::*;
        let op = match (level, self.peek().kind) {
            (0, OrOr) => BinaryOp::LogicalOr,
            (1, AndAnd) => BinaryOp::LogicalAnd,
            (2, Pipe) => BinaryOp::BitOr,
            (3, Caret) => BinaryOp::BitXor,
            (4, Amp) => BinaryOp::BitAnd,
            (5, Equal) => BinaryOp::Eq,
            (5, NotEqual) => BinaryOp::Neq,
            (6, Less) => BinaryOp::Lt,
            (6, LessEqual) => BinaryOp::Lte,
            (6, Greater) => BinaryOp::Gt,
            (6, GreaterEqual) => BinaryOp::Gte,
            (7, Shl) => BinaryOp::Shl,
            (7, Shr) => BinaryOp::Shr,
            (8, Plus) => BinaryOp::Add,
            (8, Minus) => BinaryOp::Sub,
            (9, Star) => BinaryOp::Mul,
            (9, Slash) => BinaryOp::Div,
            (9, Percent) => BinaryOp::Mod,
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, level: u8) -> PResult<Expr> {
        if level > 9 {
            return self.parse_unary();
        }

        let mut left = self.parse_binary(level + 1)?;
        while let Some(op) = self.binary_op_at(level) {
            let location = self.location();
            self.advance();
            let right = self.parse_binary(level + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                location,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let location = self.location();
        let op = match self.peek().kind {
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::LogicalNot),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Increment => Some(UnaryOp::PreIncrement),
            TokenKind::Decrement => Some(UnaryOp::PreDecrement),
            TokenKind::Amp => {
                self.advance();
                let operand = self.parse_unary()?;
                return Ok(Expr::AddressOf {
                    operand: Box::new(operand),
                    location,
                });
            }
            TokenKind::Star => {
                self.advance();
                let operand = self.parse_unary()?;
                return Ok(Expr::Dereference {
                    operand: Box::new(operand),
                    location,
                });
            }
            TokenKind::LParen if self.starts_type(self.peek_at(1).kind) => {
                // C cast: '(' type ')' unary
                self.advance();
                let ty = self.parse_type()?;
                self.expect(TokenKind::RParen, "')'")?;
                let operand = self.parse_unary()?;
                return Ok(Expr::Cast {
                    ty,
                    operand: Box::new(operand),
                    location,
                });
            }
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                location,
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek().kind {
                TokenKind::Dot | TokenKind::Arrow => {
                    let via_pointer = self.peek().kind == TokenKind::Arrow;
                    let location = self.location();
                    self.advance();

                    // Message operations are member-shaped: `Q.send(x)`.
                    if self.check(TokenKind::Send) || self.check(TokenKind::Recv) {
                        expr = self.parse_message_op(expr, location)?;
                        continue;
                    }

                    let field = self.expect(TokenKind::Identifier, "field name")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        field: field.lexeme,
                        via_pointer,
                        location,
                    };
                }
                TokenKind::LBracket => {
                    let location = self.location();
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    expr = Expr::ArrayAccess {
                        array: Box::new(expr),
                        index: Box::new(index),
                        location,
                    };
                }
                TokenKind::Increment => {
                    let location = self.location();
                    self.advance();
                    expr = Expr::Postfix {
                        op: PostfixOp::Increment,
                        operand: Box::new(expr),
                        location,
                    };
                }
                TokenKind::Decrement => {
                    let location = self.location();
                    self.advance();
                    expr = Expr::Postfix {
                        op: PostfixOp::Decrement,
                        operand: Box::new(expr),
                        location,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_message_op(&mut self, object: Expr, location: Location) -> PResult<Expr> {
        let queue = match object {
            Expr::Identifier { name, .. } => name,
            other => {
                return Err(ParseError::Invalid {
                    message: "message operations require a queue name".to_owned(),
                    location: other.location().clone(),
                })
            }
        };

        if self.eat(TokenKind::Send) {
            self.expect(TokenKind::LParen, "'('")?;
            let payload = self.parse_expr()?;
            self.expect(TokenKind::RParen, "')'")?;
            Ok(Expr::MessageSend {
                queue,
                payload: Box::new(payload),
                location,
            })
        } else {
            self.expect(TokenKind::Recv, "'recv'")?;
            self.expect(TokenKind::LParen, "'('")?;
            let timeout = if self.check(TokenKind::RParen) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            self.expect(TokenKind::RParen, "')'")?;
            Ok(Expr::MessageRecv {
                queue,
                timeout,
                location,
            })
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let location = self.location();

        match self.peek().kind {
            TokenKind::Integer => {
                let token = self.advance();
                let value = token.int_value().ok_or_else(|| ParseError::Invalid {
                    message: format!("integer literal '{}' out of range", token.lexeme),
                    location: token.location(),
                })?;
                Ok(Expr::Literal {
                    value: LiteralValue::Int(value),
                    location,
                })
            }
            TokenKind::Float => {
                let token = self.advance();
                let value =
                    token.lexeme.parse::<f32>().map_err(|_| ParseError::Invalid {
                        message: format!("float literal '{}' out of range", token.lexeme),
                        location: token.location(),
                    })?;
                Ok(Expr::Literal {
                    value: LiteralValue::Float(value),
                    location,
                })
            }
            TokenKind::Str => {
                let token = self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Str(token.lexeme),
                    location,
                })
            }
            TokenKind::Char => {
                let token = self.advance();
                let ch = token.lexeme.chars().next().unwrap_or('\0');
                Ok(Expr::Literal {
                    value: LiteralValue::Char(ch),
                    location,
                })
            }
            TokenKind::Boolean => {
                let token = self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Bool(token.lexeme == "true"),
                    location,
                })
            }
            TokenKind::SizeOf => {
                self.advance();
                self.expect(TokenKind::LParen, "'('")?;
                let target = if self.starts_type(self.peek().kind) {
                    SizeOfTarget::Type(self.parse_type()?)
                } else {
                    SizeOfTarget::Expr(Box::new(self.parse_expr()?))
                };
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::SizeOf { target, location })
            }
            TokenKind::Identifier => {
                let token = self.advance();
                if self.check(TokenKind::LParen) {
                    self.parse_call(token.lexeme, location)
                } else {
                    Ok(Expr::Identifier {
                        name: token.lexeme,
                        location,
                    })
                }
            }
            TokenKind::Intrinsic(intrinsic) => {
                self.advance();
                self.parse_call(intrinsic.name().to_owned(), location)
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_call(&mut self, callee: String, location: Location) -> PResult<Expr> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut arguments = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                arguments.push(self.parse_expr()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(Expr::Call {
            callee,
            arguments,
            location,
        })
    }
}
