//! Byte-oriented lexer. Operates on raw source bytes rather than `char`s or
//! `str` slices — identifiers and string contents are later handed to the
//! heap as byte buffers anyway, so there is no reason to pay for UTF-8
//! validation here.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Identifier,
    String,
    Number,
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Error,
    Eof,
}

/// A lexeme is a byte slice borrowed from the source buffer, not an owned
/// `String` — the source outlives the whole compile, so there's nothing to
/// copy until a token becomes a constant.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src [u8],
    pub line: u32,
}

impl<'src> Token<'src> {
    pub fn lexeme_str(&self) -> &'src str {
        std::str::from_utf8(self.lexeme).unwrap_or("<invalid utf-8>")
    }
}

pub struct Scanner<'src> {
    source: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if is_digit(c) {
            return self.number();
        }
        if is_alpha(c) {
            return self.identifier();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.matches(b'=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                };
                self.make_token(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn string(&mut self) -> Token<'src> {
        while !self.is_at_end() && self.peek() != b'"' {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while is_digit(self.peek()) {
            self.advance();
        }
        if self.peek() == b'.' && is_digit(self.peek_next()) {
            self.advance();
            while is_digit(self.peek()) {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || is_digit(self.peek()) {
            self.advance();
        }
        let kind = keyword_kind(&self.source[self.start..self.current]);
        self.make_token(kind)
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek_or_nul() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' if self.peek_next_or_nul() == b'/' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn peek(&self) -> u8 {
        self.source[self.current]
    }

    fn peek_or_nul(&self) -> u8 {
        self.source.get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source.get(self.current + 1).copied().unwrap_or(0)
    }

    fn peek_next_or_nul(&self) -> u8 {
        self.peek_next()
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message.as_bytes(),
            line: self.line,
        }
    }
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Hand-coded keyword lookup. A real trie buys nothing over a match on the
/// byte slice at this vocabulary size, but it's dispatched the same way a
/// trie would be: first byte narrows, full-slice comparison confirms.
fn keyword_kind(bytes: &[u8]) -> TokenKind {
    match bytes {
        b"and" => TokenKind::And,
        b"class" => TokenKind::Class,
        b"else" => TokenKind::Else,
        b"false" => TokenKind::False,
        b"for" => TokenKind::For,
        b"fun" => TokenKind::Fun,
        b"if" => TokenKind::If,
        b"nil" => TokenKind::Nil,
        b"or" => TokenKind::Or,
        b"print" => TokenKind::Print,
        b"return" => TokenKind::Return,
        b"super" => TokenKind::Super,
        b"this" => TokenKind::This,
        b"true" => TokenKind::True,
        b"var" => TokenKind::Var,
        b"while" => TokenKind::While,
        _ => TokenKind::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let tok = scanner.scan_token();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_operators_and_literals() {
        use TokenKind::*;
        assert_eq!(
            kinds("var x = 1 + 2.5;"),
            vec![Var, Identifier, Equal, Number, Plus, Number, Semicolon, Eof]
        );
    }

    #[test]
    fn two_char_operators_are_not_split() {
        use TokenKind::*;
        assert_eq!(
            kinds("a <= b != c"),
            vec![Identifier, LessEqual, Identifier, BangEqual, Identifier, Eof]
        );
    }

    #[test]
    fn comments_and_whitespace_are_skipped_and_lines_tracked() {
        let mut scanner = Scanner::new("var a = 1; // comment\nvar b = 2;");
        let mut last_line = 0;
        loop {
            let tok = scanner.scan_token();
            last_line = tok.line;
            if tok.kind == TokenKind::Eof {
                break;
            }
        }
        assert_eq!(last_line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut scanner = Scanner::new("\"oops");
        let tok = scanner.scan_token();
        assert_eq!(tok.kind, TokenKind::Error);
        assert_eq!(tok.lexeme, b"Unterminated string.");
    }

    #[test]
    fn keywords_are_not_confused_with_identifier_prefixes() {
        use TokenKind::*;
        assert_eq!(kinds("forever"), vec![Identifier, Eof]);
        assert_eq!(kinds("for"), vec![For, Eof]);
    }
}
