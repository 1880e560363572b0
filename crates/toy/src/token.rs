//! Token kinds produced by the lexer.

use strum::{Display, EnumString, IntoStaticStr};

use crate::source::Pos;

/// One lexed token: kind, literal text, and source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// The literal text of the token. For string fragments this is the
    /// decoded content (escapes applied); for everything else it is the
    /// source text.
    pub literal: String,
    pub pos: Pos,
}

impl Token {
    pub fn new(kind: TokenKind, literal: impl Into<String>, pos: Pos) -> Self {
        Self {
            kind,
            literal: literal.into(),
            pos,
        }
    }
}

/// The closed set of token kinds.
///
/// Operator tokens display as their source spelling so parse errors can say
/// `expected ')'` without a lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum TokenKind {
    #[strum(serialize = "<eof>")]
    Eof,
    #[strum(serialize = "<ident>")]
    Ident,

    // Literal classes.
    #[strum(serialize = "<int>")]
    Int,
    #[strum(serialize = "<float>")]
    Float,
    #[strum(serialize = "<char>")]
    Char,
    /// Opening `"` of an interpolated string.
    #[strum(serialize = "<lquote>")]
    LQuote,
    /// Closing `"` of an interpolated string.
    #[strum(serialize = "<rquote>")]
    RQuote,
    /// A run of literal text inside an interpolated string, or the whole
    /// body of a single-quoted/raw string.
    #[strum(serialize = "<string>")]
    StringFragment,

    // Keywords.
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "else")]
    Else,
    #[strum(serialize = "for")]
    For,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "return")]
    Return,
    #[strum(serialize = "break")]
    Break,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "fn")]
    Fn,
    #[strum(serialize = "import")]
    Import,
    #[strum(serialize = "export")]
    Export,
    #[strum(serialize = "try")]
    Try,
    #[strum(serialize = "defer")]
    Defer,
    #[strum(serialize = "true")]
    True,
    #[strum(serialize = "false")]
    False,
    #[strum(serialize = "nil")]
    Nil,

    // Punctuation.
    #[strum(serialize = "(")]
    LParen,
    #[strum(serialize = ")")]
    RParen,
    #[strum(serialize = "[")]
    LBracket,
    #[strum(serialize = "]")]
    RBracket,
    #[strum(serialize = "{{")]
    LBrace,
    #[strum(serialize = "}}")]
    RBrace,
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ";")]
    Semicolon,
    #[strum(serialize = ":")]
    Colon,
    #[strum(serialize = "?")]
    Question,
    #[strum(serialize = ".")]
    Dot,
    #[strum(serialize = "...")]
    Ellipsis,

    // Operators.
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = ":=")]
    Declare,
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Star,
    #[strum(serialize = "/")]
    Slash,
    #[strum(serialize = "%")]
    Percent,
    #[strum(serialize = "&")]
    Amp,
    #[strum(serialize = "|")]
    Pipe,
    #[strum(serialize = "^")]
    Caret,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = "&&")]
    AndAnd,
    #[strum(serialize = "||")]
    OrOr,
    #[strum(serialize = "!")]
    Bang,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = "<=")]
    LessEq,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = ">=")]
    GreaterEq,

    // Compound assignment.
    #[strum(serialize = "+=")]
    PlusAssign,
    #[strum(serialize = "-=")]
    MinusAssign,
    #[strum(serialize = "*=")]
    StarAssign,
    #[strum(serialize = "/=")]
    SlashAssign,
    #[strum(serialize = "%=")]
    PercentAssign,
    #[strum(serialize = "&=")]
    AmpAssign,
    #[strum(serialize = "|=")]
    PipeAssign,
    #[strum(serialize = "^=")]
    CaretAssign,
    #[strum(serialize = "<<=")]
    ShlAssign,
    #[strum(serialize = ">>=")]
    ShrAssign,
}

impl TokenKind {
    /// Looks up the keyword kind for an identifier, if it is one.
    #[must_use]
    pub fn keyword(ident: &str) -> Option<Self> {
        Some(match ident {
            "if" => Self::If,
            "else" => Self::Else,
            "for" => Self::For,
            "in" => Self::In,
            "return" => Self::Return,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "fn" => Self::Fn,
            "import" => Self::Import,
            "export" => Self::Export,
            "try" => Self::Try,
            "defer" => Self::Defer,
            "true" => Self::True,
            "false" => Self::False,
            "nil" => Self::Nil,
            _ => return None,
        })
    }

    /// Returns true when a logical line may end after this token, which is
    /// when automatic semicolon insertion applies.
    #[must_use]
    pub fn ends_statement(self) -> bool {
        matches!(
            self,
            Self::Ident
                | Self::Int
                | Self::Float
                | Self::Char
                | Self::RQuote
                | Self::StringFragment
                | Self::True
                | Self::False
                | Self::Nil
                | Self::Return
                | Self::Break
                | Self::Continue
                | Self::RParen
                | Self::RBracket
                | Self::RBrace
        )
    }

    /// Returns the compound-assignment base operator, if this token is one.
    #[must_use]
    pub fn compound_base(self) -> Option<Self> {
        Some(match self {
            Self::PlusAssign => Self::Plus,
            Self::MinusAssign => Self::Minus,
            Self::StarAssign => Self::Star,
            Self::SlashAssign => Self::Slash,
            Self::PercentAssign => Self::Percent,
            Self::AmpAssign => Self::Amp,
            Self::PipeAssign => Self::Pipe,
            Self::CaretAssign => Self::Caret,
            Self::ShlAssign => Self::Shl,
            Self::ShrAssign => Self::Shr,
            _ => return None,
        })
    }
}
