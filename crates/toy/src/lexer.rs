//! The lexer: UTF-8 source text to a positioned token stream.
//!
//! Interpolated strings are tokenized as `LQuote`, then alternating
//! `StringFragment` and `{ ... }` expression runs, then `RQuote`. The lexer
//! keeps a mode stack so `{` inside an interpolation re-enters code mode and
//! the matching `}` drops back into string mode, with a per-level brace
//! depth for table literals nested inside interpolations.
//!
//! The lexer never fails hard: malformed input produces a [`Diagnostic`]
//! and lexing continues from a best-effort recovery point.

use crate::{
    error::Diagnostic,
    source::{FileId, FileSet, Pos},
    token::{Token, TokenKind},
};

/// Lexer mode: either ordinary code or the body of an interpolated string.
#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Ordinary code. `braces` counts `{` opened at this level so the lexer
    /// knows which `}` terminates an interpolation.
    Code { braces: u32 },
    /// Inside a double-quoted string body, between fragments.
    Str,
}

/// Streaming lexer over one source file.
pub(crate) struct Lexer<'src> {
    src: &'src str,
    /// Byte offset of the next unread character.
    offset: usize,
    file: FileId,
    file_set: &'src FileSet,
    modes: Vec<Mode>,
    /// Kind of the last emitted significant token, for semicolon insertion.
    prev: Option<TokenKind>,
    /// Token queued by semicolon insertion, delivered before lexing resumes.
    pending: Option<Token>,
    errors: Vec<Diagnostic>,
    finished: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(file_set: &'src FileSet, file: FileId) -> Self {
        Self {
            src: file_set.text(file),
            offset: 0,
            file,
            file_set,
            modes: vec![Mode::Code { braces: 0 }],
            prev: None,
            pending: None,
            errors: Vec::new(),
            finished: false,
        }
    }

    /// Lexes the whole file into a token vector ending with `Eof`.
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<Diagnostic>) {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        (tokens, self.errors)
    }

    fn pos_here(&self) -> Pos {
        self.pos_at(self.offset)
    }

    fn pos_at(&self, offset: usize) -> Pos {
        self.file_set
            .pos(self.file, u32::try_from(offset).expect("source exceeds u32"))
    }

    fn peek(&self) -> Option<char> {
        self.src[self.offset..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.src[self.offset..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.offset += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.offset += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn error(&mut self, message: impl Into<String>, pos: Pos) {
        self.errors.push(Diagnostic::new(message, pos));
    }

    fn emit(&mut self, kind: TokenKind, literal: impl Into<String>, pos: Pos) -> Token {
        self.prev = Some(kind);
        Token::new(kind, literal, pos)
    }

    /// Produces the next token, applying automatic semicolon insertion.
    pub fn next_token(&mut self) -> Token {
        if let Some(tok) = self.pending.take() {
            self.prev = Some(tok.kind);
            return tok;
        }
        match *self.modes.last().expect("mode stack never empty") {
            Mode::Str => self.next_in_string(),
            Mode::Code { .. } => self.next_in_code(),
        }
    }

    fn next_in_code(&mut self) -> Token {
        if let Some(tok) = self.skip_trivia() {
            return tok;
        }
        let start = self.offset;
        let pos = self.pos_here();
        let Some(ch) = self.bump() else {
            if !self.finished && self.prev.is_some_and(TokenKind::ends_statement) {
                self.finished = true;
                return self.emit(TokenKind::Semicolon, ";", pos);
            }
            self.finished = true;
            return self.emit(TokenKind::Eof, "", pos);
        };

        match ch {
            'a'..='z' | 'A'..='Z' | '_' => self.lex_ident(start, pos),
            '0'..='9' => self.lex_number(start, pos),
            '"' => {
                self.modes.push(Mode::Str);
                self.emit(TokenKind::LQuote, "\"", pos)
            }
            '\'' => self.lex_char(pos),
            '`' => self.lex_raw(pos),
            '(' => self.emit(TokenKind::LParen, "(", pos),
            ')' => self.emit(TokenKind::RParen, ")", pos),
            '[' => self.emit(TokenKind::LBracket, "[", pos),
            ']' => self.emit(TokenKind::RBracket, "]", pos),
            '{' => {
                if let Mode::Code { braces } = self.modes.last_mut().expect("mode stack never empty") {
                    *braces += 1;
                }
                self.emit(TokenKind::LBrace, "{", pos)
            }
            '}' => self.lex_close_brace(pos),
            ',' => self.emit(TokenKind::Comma, ",", pos),
            ';' => self.emit(TokenKind::Semicolon, ";", pos),
            '?' => self.emit(TokenKind::Question, "?", pos),
            ':' => {
                if self.eat('=') {
                    self.emit(TokenKind::Declare, ":=", pos)
                } else {
                    self.emit(TokenKind::Colon, ":", pos)
                }
            }
            '.' => {
                if self.src[self.offset..].starts_with("..") {
                    self.offset += 2;
                    self.emit(TokenKind::Ellipsis, "...", pos)
                } else {
                    self.emit(TokenKind::Dot, ".", pos)
                }
            }
            '=' => {
                if self.eat('=') {
                    self.emit(TokenKind::Eq, "==", pos)
                } else {
                    self.emit(TokenKind::Assign, "=", pos)
                }
            }
            '+' => {
                if self.eat('=') {
                    self.emit(TokenKind::PlusAssign, "+=", pos)
                } else {
                    self.emit(TokenKind::Plus, "+", pos)
                }
            }
            '-' => {
                if self.eat('=') {
                    self.emit(TokenKind::MinusAssign, "-=", pos)
                } else {
                    self.emit(TokenKind::Minus, "-", pos)
                }
            }
            '*' => {
                if self.eat('=') {
                    self.emit(TokenKind::StarAssign, "*=", pos)
                } else {
                    self.emit(TokenKind::Star, "*", pos)
                }
            }
            '/' => {
                if self.eat('=') {
                    self.emit(TokenKind::SlashAssign, "/=", pos)
                } else {
                    self.emit(TokenKind::Slash, "/", pos)
                }
            }
            '%' => {
                if self.eat('=') {
                    self.emit(TokenKind::PercentAssign, "%=", pos)
                } else {
                    self.emit(TokenKind::Percent, "%", pos)
                }
            }
            '&' => {
                if self.eat('&') {
                    self.emit(TokenKind::AndAnd, "&&", pos)
                } else if self.eat('=') {
                    self.emit(TokenKind::AmpAssign, "&=", pos)
                } else {
                    self.emit(TokenKind::Amp, "&", pos)
                }
            }
            '|' => {
                if self.eat('|') {
                    self.emit(TokenKind::OrOr, "||", pos)
                } else if self.eat('=') {
                    self.emit(TokenKind::PipeAssign, "|=", pos)
                } else {
                    self.emit(TokenKind::Pipe, "|", pos)
                }
            }
            '^' => {
                if self.eat('=') {
                    self.emit(TokenKind::CaretAssign, "^=", pos)
                } else {
                    self.emit(TokenKind::Caret, "^", pos)
                }
            }
            '!' => {
                if self.eat('=') {
                    self.emit(TokenKind::NotEq, "!=", pos)
                } else {
                    self.emit(TokenKind::Bang, "!", pos)
                }
            }
            '<' => {
                if self.eat('<') {
                    if self.eat('=') {
                        self.emit(TokenKind::ShlAssign, "<<=", pos)
                    } else {
                        self.emit(TokenKind::Shl, "<<", pos)
                    }
                } else if self.eat('=') {
                    self.emit(TokenKind::LessEq, "<=", pos)
                } else {
                    self.emit(TokenKind::Less, "<", pos)
                }
            }
            '>' => {
                if self.eat('>') {
                    if self.eat('=') {
                        self.emit(TokenKind::ShrAssign, ">>=", pos)
                    } else {
                        self.emit(TokenKind::Shr, ">>", pos)
                    }
                } else if self.eat('=') {
                    self.emit(TokenKind::GreaterEq, ">=", pos)
                } else {
                    self.emit(TokenKind::Greater, ">", pos)
                }
            }
            other => {
                self.error(format!("unexpected character {other:?}"), pos);
                // Skip it and continue with the next token.
                self.next_in_code()
            }
        }
    }

    /// Handles `}` in code mode: either a plain closing brace or the end of
    /// an interpolation expression.
    fn lex_close_brace(&mut self, pos: Pos) -> Token {
        let top = self.modes.last_mut().expect("mode stack never empty");
        if let Mode::Code { braces } = top {
            if *braces > 0 {
                *braces -= 1;
                return self.emit(TokenKind::RBrace, "}", pos);
            }
        }
        if self.modes.len() > 1 {
            // This code level was entered from a string interpolation.
            self.modes.pop();
            return self.emit(TokenKind::RBrace, "}", pos);
        }
        self.emit(TokenKind::RBrace, "}", pos)
    }

    /// Skips whitespace and comments. Returns an inserted semicolon token
    /// when a newline terminates a statement-ending token.
    fn skip_trivia(&mut self) -> Option<Token> {
        loop {
            match self.peek() {
                Some('\n') => {
                    let pos = self.pos_here();
                    self.bump();
                    if self.prev.is_some_and(TokenKind::ends_statement) && self.pending.is_none() {
                        return Some(self.emit(TokenKind::Semicolon, ";", pos));
                    }
                }
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let pos = self.pos_here();
                    self.offset += 2;
                    let mut closed = false;
                    while let Some(c) = self.bump() {
                        if c == '*' && self.eat('/') {
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        self.error("unterminated block comment", pos);
                    }
                }
                _ => return None,
            }
        }
    }

    fn lex_ident(&mut self, start: usize, pos: Pos) -> Token {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.offset];
        match TokenKind::keyword(text) {
            Some(kind) => self.emit(kind, text, pos),
            None => self.emit(TokenKind::Ident, text, pos),
        }
    }

    fn lex_number(&mut self, start: usize, pos: Pos) -> Token {
        let first = self.src.as_bytes()[start];
        if first == b'0' {
            match self.peek() {
                Some('x' | 'X') => return self.lex_radix(start, pos, 16),
                Some('o' | 'O') => return self.lex_radix(start, pos, 8),
                Some('b' | 'B') => return self.lex_radix(start, pos, 2),
                _ => {}
            }
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() || c == '_' {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let save = self.offset;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.bump();
                }
            } else {
                // Not an exponent after all (e.g. `1e` followed by an ident).
                self.offset = save;
            }
        }
        let text = &self.src[start..self.offset];
        let kind = if is_float { TokenKind::Float } else { TokenKind::Int };
        self.emit(kind, text, pos)
    }

    fn lex_radix(&mut self, start: usize, pos: Pos, radix: u32) -> Token {
        self.bump(); // the x/o/b marker
        let digits_start = self.offset;
        while let Some(c) = self.peek() {
            if c.is_digit(radix) || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        if self.offset == digits_start {
            self.error("number literal has no digits", pos);
        }
        let text = &self.src[start..self.offset];
        self.emit(TokenKind::Int, text, pos)
    }

    /// Lexes a single-quoted literal. A single code point is a char; longer
    /// content is a plain (non-interpolated) string.
    fn lex_char(&mut self, pos: Pos) -> Token {
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    self.error("unterminated character literal", pos);
                    break;
                }
                Some('\'') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    if let Some(c) = self.lex_escape(pos, '\'') {
                        value.push(c);
                    }
                }
                Some(c) => {
                    self.bump();
                    value.push(c);
                }
            }
        }
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(_), None) => self.emit(TokenKind::Char, value, pos),
            _ => self.emit(TokenKind::StringFragment, value, pos),
        }
    }

    /// Lexes a raw backtick string: no escapes, no interpolation.
    fn lex_raw(&mut self, pos: Pos) -> Token {
        let start = self.offset;
        loop {
            match self.peek() {
                None => {
                    self.error("unterminated raw string", pos);
                    break;
                }
                Some('`') => break,
                _ => {
                    self.bump();
                }
            }
        }
        let value = self.src[start..self.offset].to_owned();
        self.eat('`');
        self.emit(TokenKind::StringFragment, value, pos)
    }

    /// Lexes the next token inside a double-quoted string body.
    fn next_in_string(&mut self) -> Token {
        let pos = self.pos_here();
        match self.peek() {
            None => {
                self.error("unterminated string", pos);
                self.modes.pop();
                self.emit(TokenKind::RQuote, "", pos)
            }
            Some('"') => {
                self.bump();
                self.modes.pop();
                self.emit(TokenKind::RQuote, "\"", pos)
            }
            Some('{') => {
                self.bump();
                self.modes.push(Mode::Code { braces: 0 });
                self.emit(TokenKind::LBrace, "{", pos)
            }
            _ => self.lex_fragment(pos),
        }
    }

    fn lex_fragment(&mut self, pos: Pos) -> Token {
        let mut value = String::new();
        loop {
            match self.peek() {
                None => {
                    self.error("unterminated string", pos);
                    break;
                }
                Some('"' | '{') => break,
                Some('\n') => {
                    self.error("unterminated string", pos);
                    break;
                }
                Some('\\') => {
                    self.bump();
                    if let Some(c) = self.lex_escape(pos, '"') {
                        value.push(c);
                    }
                }
                Some(c) => {
                    self.bump();
                    value.push(c);
                }
            }
        }
        self.emit(TokenKind::StringFragment, value, pos)
    }

    /// Decodes one escape sequence after a consumed `\`.
    fn lex_escape(&mut self, pos: Pos, quote: char) -> Option<char> {
        let Some(c) = self.bump() else {
            self.error("unterminated escape sequence", pos);
            return None;
        };
        match c {
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            '0' => Some('\0'),
            '\\' => Some('\\'),
            '{' => Some('{'),
            '}' => Some('}'),
            'x' => {
                let hi = self.bump();
                let lo = self.bump();
                match (hi.and_then(|c| c.to_digit(16)), lo.and_then(|c| c.to_digit(16))) {
                    (Some(hi), Some(lo)) => char::from_u32(hi * 16 + lo),
                    _ => {
                        self.error("invalid \\x escape", pos);
                        None
                    }
                }
            }
            'u' => {
                if !self.eat('{') {
                    self.error("expected '{' after \\u", pos);
                    return None;
                }
                let start = self.offset;
                while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                    self.bump();
                }
                let digits = &self.src[start..self.offset];
                let ok = self.eat('}');
                let scalar = u32::from_str_radix(digits, 16).ok().and_then(char::from_u32);
                if !ok || scalar.is_none() {
                    self.error("invalid \\u escape", pos);
                }
                scalar
            }
            c if c == quote => Some(c),
            other => {
                self.error(format!("invalid escape sequence \\{other}"), pos);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FileSet;

    fn lex(src: &str) -> (Vec<Token>, Vec<Diagnostic>) {
        let mut set = FileSet::new();
        let id = set.add_file("test.toy", src.to_owned());
        Lexer::new(&set, id).tokenize()
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "unexpected lex errors: {errors:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration() {
        use TokenKind::{Declare, Eof, Ident, Int, Semicolon};
        assert_eq!(kinds("x := 42"), vec![Ident, Declare, Int, Semicolon, Eof]);
    }

    #[test]
    fn semicolon_inserted_at_newline() {
        use TokenKind::{Eof, Ident, Int, Plus, Semicolon};
        assert_eq!(kinds("a\nb + 1\n"), vec![Ident, Semicolon, Ident, Plus, Int, Semicolon, Eof]);
    }

    #[test]
    fn no_semicolon_after_operator() {
        use TokenKind::{Eof, Ident, Plus, Semicolon};
        // The expression continues across the newline after `+`.
        assert_eq!(kinds("a +\nb"), vec![Ident, Plus, Ident, Semicolon, Eof]);
    }

    #[test]
    fn no_semicolon_inside_table_literal() {
        use TokenKind::{Colon, Eof, Ident, Int, LBrace, RBrace, Semicolon};
        // `}` itself terminates the logical line; nothing is inserted
        // between the value and the closing brace.
        assert_eq!(
            kinds("{a: 1}"),
            vec![LBrace, Ident, Colon, Int, RBrace, Semicolon, Eof]
        );
    }

    #[test]
    fn numeric_literals() {
        let (tokens, errors) = lex("12 0xfF 0o17 0b101 1.5 2e3 1_000");
        assert!(errors.is_empty());
        let literals: Vec<(TokenKind, &str)> = tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Int | TokenKind::Float))
            .map(|t| (t.kind, t.literal.as_str()))
            .collect();
        assert_eq!(
            literals,
            vec![
                (TokenKind::Int, "12"),
                (TokenKind::Int, "0xfF"),
                (TokenKind::Int, "0o17"),
                (TokenKind::Int, "0b101"),
                (TokenKind::Float, "1.5"),
                (TokenKind::Float, "2e3"),
                (TokenKind::Int, "1_000"),
            ]
        );
    }

    #[test]
    fn interpolated_string_tokens() {
        use TokenKind::{Eof, Ident, LBrace, LQuote, RBrace, RQuote, Semicolon, StringFragment};
        assert_eq!(
            kinds(r#""a {x} b""#),
            vec![
                LQuote,
                StringFragment,
                LBrace,
                Ident,
                RBrace,
                StringFragment,
                RQuote,
                Semicolon,
                Eof
            ]
        );
    }

    #[test]
    fn nested_braces_inside_interpolation() {
        use TokenKind::{Colon, Eof, Ident, Int, LBrace, LQuote, RBrace, RQuote, Semicolon};
        // The table literal's braces don't terminate the interpolation.
        assert_eq!(
            kinds(r#""{ {a: 1} }""#),
            vec![
                LQuote,
                LBrace,
                LBrace,
                Ident,
                Colon,
                Int,
                RBrace,
                RBrace,
                RQuote,
                Semicolon,
                Eof
            ]
        );
    }

    #[test]
    fn escapes_decoded_in_fragments() {
        let (tokens, errors) = lex(r#""a\nb\x41\u{1F600}""#);
        assert!(errors.is_empty());
        let fragment = tokens
            .iter()
            .find(|t| t.kind == TokenKind::StringFragment)
            .unwrap();
        assert_eq!(fragment.literal, "a\nbA\u{1F600}");
    }

    #[test]
    fn char_and_plain_string_literals() {
        let (tokens, errors) = lex("'a' 'ab' `raw\\n`");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Char);
        assert_eq!(tokens[0].literal, "a");
        assert_eq!(tokens[1].kind, TokenKind::StringFragment);
        assert_eq!(tokens[1].literal, "ab");
        // Raw strings keep backslashes verbatim.
        assert_eq!(tokens[2].kind, TokenKind::StringFragment);
        assert_eq!(tokens[2].literal, "raw\\n");
    }

    #[test]
    fn unterminated_string_is_reported_not_fatal() {
        let (tokens, errors) = lex("\"abc");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unterminated"));
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn invalid_escape_is_reported() {
        let (_, errors) = lex(r#""\q""#);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("invalid escape"));
    }

    #[test]
    fn comments_are_skipped() {
        use TokenKind::{Eof, Ident, Semicolon};
        assert_eq!(kinds("// line\na /* block */\n"), vec![Ident, Semicolon, Eof]);
    }

    #[test]
    fn compound_assignment_operators() {
        use TokenKind::{Eof, Ident, Int, Semicolon, ShlAssign};
        assert_eq!(kinds("x <<= 2"), vec![Ident, ShlAssign, Int, Semicolon, Eof]);
    }
}
