//! Lexical analysis: UTF-8 source text to a token stream.

use std::sync::Arc;

use crate::source::Location;

/// Built-in function names the language reserves. Each one lowers to a fixed
/// opcode sequence and is type-checked against a fixed signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    RtosCreateTask,
    RtosDeleteTask,
    RtosDelayMs,
    RtosSemaphoreCreate,
    RtosSemaphoreTake,
    RtosSemaphoreGive,
    RtosYield,
    RtosSuspendTask,
    RtosResumeTask,
    HwGpioInit,
    HwGpioSet,
    HwGpioGet,
    HwTimerInit,
    HwTimerStart,
    HwTimerStop,
    HwTimerSetPwmDuty,
    HwAdcInit,
    HwAdcRead,
    HwUartWrite,
    HwSpiTransfer,
    HwI2cWrite,
    HwI2cRead,
    DbgPrint,
    DbgBreakpoint,
    Print,
    Printf,
    StartTask,
}

impl Intrinsic {
    /// Reserved word for the intrinsic.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RtosCreateTask => "RTOS_CREATE_TASK",
            Self::RtosDeleteTask => "RTOS_DELETE_TASK",
            Self::RtosDelayMs => "RTOS_DELAY_MS",
            Self::RtosSemaphoreCreate => "RTOS_SEMAPHORE_CREATE",
            Self::RtosSemaphoreTake => "RTOS_SEMAPHORE_TAKE",
            Self::RtosSemaphoreGive => "RTOS_SEMAPHORE_GIVE",
            Self::RtosYield => "RTOS_YIELD",
            Self::RtosSuspendTask => "RTOS_SUSPEND_TASK",
            Self::RtosResumeTask => "RTOS_RESUME_TASK",
            Self::HwGpioInit => "HW_GPIO_INIT",
            Self::HwGpioSet => "HW_GPIO_SET",
            Self::HwGpioGet => "HW_GPIO_GET",
            Self::HwTimerInit => "HW_TIMER_INIT",
            Self::HwTimerStart => "HW_TIMER_START",
            Self::HwTimerStop => "HW_TIMER_STOP",
            Self::HwTimerSetPwmDuty => "HW_TIMER_SET_PWM_DUTY",
            Self::HwAdcInit => "HW_ADC_INIT",
            Self::HwAdcRead => "HW_ADC_READ",
            Self::HwUartWrite => "HW_UART_WRITE",
            Self::HwSpiTransfer => "HW_SPI_TRANSFER",
            Self::HwI2cWrite => "HW_I2C_WRITE",
            Self::HwI2cRead => "HW_I2C_READ",
            Self::DbgPrint => "DBG_PRINT",
            Self::DbgBreakpoint => "DBG_BREAKPOINT",
            Self::Print => "print",
            Self::Printf => "printf",
            Self::StartTask => "StartTask",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "RTOS_CREATE_TASK" => Self::RtosCreateTask,
            "RTOS_DELETE_TASK" => Self::RtosDeleteTask,
            "RTOS_DELAY_MS" => Self::RtosDelayMs,
            "RTOS_SEMAPHORE_CREATE" => Self::RtosSemaphoreCreate,
            "RTOS_SEMAPHORE_TAKE" => Self::RtosSemaphoreTake,
            "RTOS_SEMAPHORE_GIVE" => Self::RtosSemaphoreGive,
            "RTOS_YIELD" => Self::RtosYield,
            "RTOS_SUSPEND_TASK" => Self::RtosSuspendTask,
            "RTOS_RESUME_TASK" => Self::RtosResumeTask,
            "HW_GPIO_INIT" => Self::HwGpioInit,
            "HW_GPIO_SET" => Self::HwGpioSet,
            "HW_GPIO_GET" => Self::HwGpioGet,
            "HW_TIMER_INIT" => Self::HwTimerInit,
            "HW_TIMER_START" => Self::HwTimerStart,
            "HW_TIMER_STOP" => Self::HwTimerStop,
            "HW_TIMER_SET_PWM_DUTY" => Self::HwTimerSetPwmDuty,
            "HW_ADC_INIT" => Self::HwAdcInit,
            "HW_ADC_READ" => Self::HwAdcRead,
            "HW_UART_WRITE" => Self::HwUartWrite,
            "HW_SPI_TRANSFER" => Self::HwSpiTransfer,
            "HW_I2C_WRITE" => Self::HwI2cWrite,
            "HW_I2C_READ" => Self::HwI2cRead,
            "DBG_PRINT" => Self::DbgPrint,
            "DBG_BREAKPOINT" => Self::DbgBreakpoint,
            "print" => Self::Print,
            "printf" => Self::Printf,
            "StartTask" => Self::StartTask,
            _ => return None,
        })
    }
}

/// Token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals. The decoded text lives in the token's lexeme.
    Integer,
    Float,
    Str,
    Char,
    Boolean,

    Identifier,

    // Type and declaration keywords.
    Int,
    FloatType,
    CharType,
    BoolType,
    Void,
    Const,
    Struct,
    Union,
    Message,
    Include,
    SizeOf,

    // Message queue operations.
    Send,
    Recv,

    // Control flow.
    If,
    Else,
    While,
    For,
    Break,
    Continue,
    Return,

    /// Reserved built-in function name.
    Intrinsic(Intrinsic),

    // Operators.
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    Increment,
    Decrement,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    Bang,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,

    // Delimiters.
    Semicolon,
    Comma,
    Dot,
    Arrow,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    Eof,
}

/// A lexed token. For string and character literals the lexeme holds the
/// decoded content (escapes resolved); for everything else, the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
    pub column: u32,
    pub file: Arc<str>,
}

impl Token {
    /// Position of the token's first character.
    pub fn location(&self) -> Location {
        Location::new(&self.file, self.line, self.column)
    }

    /// Parse an integer literal lexeme, honoring a `0x`/`0X` prefix.
    pub fn int_value(&self) -> Option<i64> {
        let s = &self.lexeme;
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok().map(i64::from)
        } else {
            s.parse::<i64>().ok()
        }
    }
}

/// Lexer failures; fatal for the current file.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LexError {
    #[error("{location}: unexpected character '{character}'")]
    UnexpectedCharacter { character: char, location: Location },
    #[error("{location}: unterminated {what} literal")]
    Unterminated { what: &'static str, location: Location },
    #[error("{location}: malformed number '{lexeme}'")]
    MalformedNumber { lexeme: String, location: Location },
    #[error("{location}: unterminated block comment")]
    UnterminatedComment { location: Location },
    #[error("{location}: unknown directive '#{word}'")]
    UnknownDirective { word: String, location: Location },
}

fn keyword(word: &str) -> Option<TokenKind> {
    Some(match word {
        "int" => TokenKind::Int,
        "float" => TokenKind::FloatType,
        "char" => TokenKind::CharType,
        "bool" => TokenKind::BoolType,
        "void" => TokenKind::Void,
        "const" => TokenKind::Const,
        "struct" => TokenKind::Struct,
        "union" => TokenKind::Union,
        "message" => TokenKind::Message,
        "import" => TokenKind::Include,
        "sizeof" => TokenKind::SizeOf,
        "true" | "false" => TokenKind::Boolean,
        "send" => TokenKind::Send,
        "recv" => TokenKind::Recv,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "for" => TokenKind::For,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        _ => TokenKind::Intrinsic(Intrinsic::from_word(word)?),
    })
}

/// The tokenizer.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file: Arc<str>,
}

impl Lexer {
    /// Prepare a lexer over `source`, reporting positions against `filename`.
    pub fn new(source: &str, filename: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file: Arc::from(filename),
        }
    }

    /// Tokenize the whole input, ending with an [`TokenKind::Eof`] token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia()?;
            let Some(ch) = self.current() else {
                break;
            };

            let (line, column) = (self.line, self.column);

            let token = if ch.is_ascii_digit() {
                self.read_number()?
            } else if ch == '"' {
                self.read_string()?
            } else if ch == '\'' {
                self.read_char()?
            } else if ch.is_alphabetic() || ch == '_' {
                self.read_word()
            } else if ch == '#' {
                self.read_directive()?
            } else {
                self.read_operator(ch, line, column)?
            };

            tokens.push(token);
        }

        tokens.push(self.make(TokenKind::Eof, String::new(), self.line, self.column));
        tracing::debug!(count = tokens.len(), file = %self.file, "tokenized");
        Ok(tokens)
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn location(&self) -> Location {
        Location::new(&self.file, self.line, self.column)
    }

    fn make(&self, kind: TokenKind, lexeme: String, line: u32, column: u32) -> Token {
        Token {
            kind,
            lexeme,
            line,
            column,
            file: Arc::clone(&self.file),
        }
    }

    /// Skip whitespace and both comment forms.
    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.current() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek() == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek() == Some('*') => {
                    let location = self.location();
                    self.advance();
                    self.advance();
                    loop {
                        match self.current() {
                            Some('*') if self.peek() == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => {
                                return Err(LexError::UnterminatedComment { location })
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        let mut lexeme = String::new();

        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            lexeme.push(self.advance().expect("digit"));
            lexeme.push(self.advance().expect("x"));
            let digits_start = lexeme.len();
            while let Some(c) = self.current() {
                if c.is_ascii_hexdigit() {
                    lexeme.push(self.advance().expect("hex digit"));
                } else {
                    break;
                }
            }
            let valid = lexeme.len() > digits_start
                && u32::from_str_radix(&lexeme[digits_start..], 16).is_ok();
            if !valid {
                return Err(LexError::MalformedNumber {
                    lexeme,
                    location: Location::new(&self.file, line, column),
                });
            }
            return Ok(self.make(TokenKind::Integer, lexeme, line, column));
        }

        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                lexeme.push(self.advance().expect("digit"));
            } else {
                break;
            }
        }

        // A fractional part makes it a float; an exponent may follow.
        if self.current() == Some('.')
            && self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false)
        {
            lexeme.push(self.advance().expect("dot"));
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    lexeme.push(self.advance().expect("digit"));
                } else {
                    break;
                }
            }

            if matches!(self.current(), Some('e') | Some('E')) {
                lexeme.push(self.advance().expect("e"));
                if matches!(self.current(), Some('+') | Some('-')) {
                    lexeme.push(self.advance().expect("sign"));
                }
                let mut any = false;
                while let Some(c) = self.current() {
                    if c.is_ascii_digit() {
                        lexeme.push(self.advance().expect("digit"));
                        any = true;
                    } else {
                        break;
                    }
                }
                if !any {
                    return Err(LexError::MalformedNumber {
                        lexeme,
                        location: Location::new(&self.file, line, column),
                    });
                }
            }

            return Ok(self.make(TokenKind::Float, lexeme, line, column));
        }

        Ok(self.make(TokenKind::Integer, lexeme, line, column))
    }

    fn read_escaped(&mut self, quote: char, what: &'static str) -> Result<String, LexError> {
        let location = self.location();
        self.advance(); // opening quote

        let mut value = String::new();
        loop {
            match self.current() {
                None | Some('\n') => {
                    return Err(LexError::Unterminated { what, location })
                }
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(value);
                }
                Some('\\') => {
                    self.advance();
                    let escaped = self
                        .advance()
                        .ok_or(LexError::Unterminated { what, location: location.clone() })?;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        '\'' => '\'',
                        other => other,
                    });
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        let value = self.read_escaped('"', "string")?;
        Ok(self.make(TokenKind::Str, value, line, column))
    }

    fn read_char(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        let value = self.read_escaped('\'', "character")?;
        if value.chars().count() != 1 {
            return Err(LexError::Unterminated {
                what: "character",
                location: Location::new(&self.file, line, column),
            });
        }
        Ok(self.make(TokenKind::Char, value, line, column))
    }

    fn read_word(&mut self) -> Token {
        let (line, column) = (self.line, self.column);
        let mut word = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                word.push(self.advance().expect("word char"));
            } else {
                break;
            }
        }
        let kind = keyword(&word).unwrap_or(TokenKind::Identifier);
        self.make(kind, word, line, column)
    }

    fn read_directive(&mut self) -> Result<Token, LexError> {
        let (line, column) = (self.line, self.column);
        self.advance(); // '#'
        let mut word = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() {
                word.push(self.advance().expect("directive char"));
            } else {
                break;
            }
        }
        if word == "include" {
            Ok(self.make(TokenKind::Include, word, line, column))
        } else {
            Err(LexError::UnknownDirective {
                word,
                location: Location::new(&self.file, line, column),
            })
        }
    }

    fn read_operator(
        &mut self,
        ch: char,
        line: u32,
        column: u32,
    ) -> Result<Token, LexError> {
        use TokenKind::*;

        let two = |a: char, b: char, kind: TokenKind| (a, b, kind);
        let pairs = [
            two('+', '+', Increment),
            two('+', '=', PlusAssign),
            two('-', '-', Decrement),
            two('-', '=', MinusAssign),
            two('-', '>', Arrow),
            two('*', '=', StarAssign),
            two('/', '=', SlashAssign),
            two('=', '=', Equal),
            two('!', '=', NotEqual),
            two('<', '=', LessEqual),
            two('>', '=', GreaterEqual),
            two('<', '<', Shl),
            two('>', '>', Shr),
            two('&', '&', AndAnd),
            two('|', '|', OrOr),
        ];

        if let Some(next) = self.peek() {
            for (a, b, kind) in pairs {
                if ch == a && next == b {
                    self.advance();
                    self.advance();
                    return Ok(self.make(kind, format!("{a}{b}"), line, column));
                }
            }
        }

        let kind = match ch {
            '+' => Plus,
            '-' => Minus,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '=' => Assign,
            '<' => Less,
            '>' => Greater,
            '!' => Bang,
            '&' => Amp,
            '|' => Pipe,
            '^' => Caret,
            '~' => Tilde,
            ';' => Semicolon,
            ',' => Comma,
            '.' => Dot,
            ':' => Colon,
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            other => {
                return Err(LexError::UnexpectedCharacter {
                    character: other,
                    location: Location::new(&self.file, line, column),
                })
            }
        };

        self.advance();
        Ok(self.make(kind, ch.to_string(), line, column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source, "test.rtmc").tokenize().expect("lexes")
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("int x"),
            vec![TokenKind::Int, TokenKind::Identifier, TokenKind::Eof]
        );
        assert_eq!(
            kinds("RTOS_DELAY_MS"),
            vec![
                TokenKind::Intrinsic(Intrinsic::RtosDelayMs),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn compound_operators_win_over_single() {
        assert_eq!(
            kinds("a <= b << 2"),
            vec![
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::Identifier,
                TokenKind::Shl,
                TokenKind::Integer,
                TokenKind::Eof
            ]
        );
        assert_eq!(kinds("p->x")[1], TokenKind::Arrow);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // trailing\n/* block\nspanning */ 2"),
            vec![TokenKind::Integer, TokenKind::Integer, TokenKind::Eof]
        );
    }

    #[test]
    fn string_escapes_decode() {
        let tokens = lex(r#""a\tb\n\"q\"""#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "a\tb\n\"q\"");
    }

    #[test]
    fn char_literals() {
        let tokens = lex(r"'x' '\n'");
        assert_eq!(tokens[0].lexeme, "x");
        assert_eq!(tokens[1].lexeme, "\n");
    }

    #[test]
    fn positions_are_one_based() {
        let tokens = lex("int\n  x;");
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn float_with_exponent() {
        let tokens = lex("3.25 1.0e-3 7.5E2");
        assert!(tokens[..3].iter().all(|t| t.kind == TokenKind::Float));
    }

    #[test]
    fn integer_requires_fraction_digits_for_float() {
        // `1.` followed by a member access must stay an integer and a dot.
        assert_eq!(
            kinds("1.x")[..3],
            [TokenKind::Integer, TokenKind::Dot, TokenKind::Identifier]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let err = Lexer::new("\"abc", "t.rtmc").tokenize().unwrap_err();
        assert!(matches!(err, LexError::Unterminated { what: "string", .. }));
    }

    #[test]
    fn stray_character_errors() {
        let err = Lexer::new("int $x;", "t.rtmc").tokenize().unwrap_err();
        assert!(matches!(
            err,
            LexError::UnexpectedCharacter { character: '$', .. }
        ));
    }

    #[quickcheck]
    fn qc_hex_literals_round_trip(value: u32) -> bool {
        let upper = format!("0x{value:X}");
        let lower = format!("0x{value:x}");
        [upper, lower].into_iter().all(|lexeme| {
            let tokens = lex(&lexeme);
            tokens[0].kind == TokenKind::Integer
                && tokens[0].int_value() == Some(i64::from(value))
        })
    }

    #[quickcheck]
    fn qc_decimal_literals_round_trip(value: u32) -> bool {
        let tokens = lex(&value.to_string());
        tokens[0].int_value() == Some(i64::from(value))
    }
}
