#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Integer(i64),
    Float(f64),
    String(std::string::String),

    // Constant keywords
    None,
    True,
    False,

    // Keywords
    Not,
    If,
    Else,
    Del,
    Raise,
    Pass,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Comparison
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,

    // Punctuation
    Assign, // =
    Dot,
    Comma,
    Colon,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Ident(std::string::String),

    // Layout
    Comment(std::string::String),
    Newline,
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{:?}", n),
            Token::String(s) => write!(f, "{:?}", s),
            Token::Ident(name) => write!(f, "{}", name),
            Token::Comment(text) => write!(f, "# {}", text),
            Token::Newline => write!(f, "newline"),
            Token::Eof => write!(f, "end of input"),
            other => write!(f, "{}", other.symbol()),
        }
    }
}

impl Token {
    fn symbol(&self) -> &'static str {
        match self {
            Token::None => "None",
            Token::True => "True",
            Token::False => "False",
            Token::Not => "not",
            Token::If => "if",
            Token::Else => "else",
            Token::Del => "del",
            Token::Raise => "raise",
            Token::Pass => "pass",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::Assign => "=",
            Token::Dot => ".",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Semicolon => ";",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            _ => "?",
        }
    }

    /// Keyword for an identifier-shaped word, if it is one.
    pub fn keyword(word: &str) -> Option<Token> {
        Some(match word {
            "None" => Token::None,
            "True" => Token::True,
            "False" => Token::False,
            "not" => Token::Not,
            "if" => Token::If,
            "else" => Token::Else,
            "del" => Token::Del,
            "raise" => Token::Raise,
            "pass" => Token::Pass,
            _ => return None,
        })
    }
}
