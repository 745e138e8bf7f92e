//! Handle Joker's lexical analysis.
//!
//! Contains the [Scanner] which implements an [Iterator] that yields [Lexeme]s, each of which
//! represents a [Token].
//!
//! # Example
//!
//! ```
//! use joker::scanner::{Scanner, Lexeme, Token};
//! let scanner = Scanner::new("println(1 + 2);");
//! let tokens: Vec<_> = scanner
//!     .map(|lexeme| lexeme.token())
//!     .take_while(|&token| token != Token::Eof) // scanner will yield Eof forever...
//!     .collect();
//!
//! use Token::*;
//! assert_eq!(
//!     vec![Identifier, LeftParen, I32Literal, Plus, I32Literal, RightParen, Semicolon],
//!     tokens
//! );
//! ```
//!
//! # Note on terminology
//!
//! A [Lexeme] is one occurrence in the source code; its [Token] is what kind of thing it is; its
//! [Lexeme::text()] is the slice of source it covers.

use enum_map::Enum;

/// A lexeme from one contiguous string from some Joker source code.
#[derive(Clone, Copy, Debug)]
pub struct Lexeme<'a> {
    /// The [Token] of this lexeme.
    token: Token,
    /// The actual text from the source code. For [Token::Error], the error message.
    text: &'a str,
    /// The line where this lexeme came from.
    line: usize,
}

/// What _type_ of [Lexeme] you have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[rustfmt::skip]
pub enum Token {
    // Single-character tokens.
    LeftParen, RightParen,
    LeftBracket, RightBracket,
    LeftBrace, RightBrace,
    Comma, Dot, Semicolon,
    Question, Underscore,
    // Arithmetic, and their compound assignments.
    Minus, MinusEqual,
    Plus, PlusEqual,
    Star, StarEqual,
    Slash, SlashEqual,
    Percent, PercentEqual,
    // Bitwise, and their compound assignments.
    Ampersand, AmpersandEqual,
    Pipe, PipeEqual,
    Caret, CaretEqual,
    Tilde,
    ShiftLeft, ShiftLeftEqual,
    ShiftRight, ShiftRightEqual,
    // Comparison and assignment.
    Bang, BangEqual,
    Equal, EqualEqual,
    Greater, GreaterEqual,
    Less, LessEqual,
    // Arrows and paths: -> => : ::
    Arrow, FatArrow,
    Colon, Layer,
    // Literals
    Identifier, StrLiteral,
    I32Literal, I64Literal, F64Literal,
    // Keywords
    And, Break, Class, Continue,
    Else, Enum, False, Fn, For,
    If, Loop, Match, NoneKeyword,
    Or, Return, SelfKeyword, Struct,
    Super, True, Var, While,

    // Others
    Error, Eof
}

/// Scans Joker source code and iteratively yields [Lexeme]s.
///
/// The scanner is stateful, and therefore, can only be used to do one pass over the source code
/// string. Once the whole source code has been scanned, the scanner will forever yield
/// [Token::Eof].
#[derive(Debug)]
pub struct Scanner<'a> {
    start: &'a str,
    current: &'a str,
    line: usize,
}

/// Scans the whole source. The last lexeme is always [Token::Eof].
pub fn tokenize(source: &str) -> Vec<Lexeme<'_>> {
    let mut scanner = Scanner::new(source);
    let mut lexemes = Vec::new();
    loop {
        let lexeme = scanner.scan_token();
        lexemes.push(lexeme);
        if lexeme.token == Token::Eof {
            return lexemes;
        }
    }
}

impl<'a> Scanner<'a> {
    /// Start scanning the given string of source code.
    pub fn new(source: &'a str) -> Self {
        Scanner {
            start: source,
            current: source,
            line: 1,
        }
    }

    /// Yield the next [Lexeme] from the string. Once the scanner has reached the end-of-file, this
    /// function will always return an end-of-file lexeme.
    pub fn scan_token(&mut self) -> Lexeme<'a> {
        if let Err(message) = self.skip_whitespace() {
            return self.error_token(message);
        }
        self.start = self.current;

        if self.is_at_end() {
            return self.make_lexeme(Token::Eof);
        }

        use Token::*;
        match self.advance() {
            c if is_id_start(c) => self.identifier(),
            c if c.is_ascii_digit() => self.number(),
            '(' => self.make_lexeme(LeftParen),
            ')' => self.make_lexeme(RightParen),
            '[' => self.make_lexeme(LeftBracket),
            ']' => self.make_lexeme(RightBracket),
            '{' => self.make_lexeme(LeftBrace),
            '}' => self.make_lexeme(RightBrace),
            ';' => self.make_lexeme(Semicolon),
            ',' => self.make_lexeme(Comma),
            '.' => self.make_lexeme(Dot),
            '?' => self.make_lexeme(Question),
            ':' => self.one_of(':', Layer, Colon),
            '+' => self.one_of('=', PlusEqual, Plus),
            '*' => self.one_of('=', StarEqual, Star),
            '/' => self.one_of('=', SlashEqual, Slash),
            '%' => self.one_of('=', PercentEqual, Percent),
            '&' => self.one_of('=', AmpersandEqual, Ampersand),
            '|' => self.one_of('=', PipeEqual, Pipe),
            '^' => self.one_of('=', CaretEqual, Caret),
            '~' => self.make_lexeme(Tilde),
            '!' => self.one_of('=', BangEqual, Bang),
            '-' => {
                if self.match_and_advance('>') {
                    self.make_lexeme(Arrow)
                } else {
                    self.one_of('=', MinusEqual, Minus)
                }
            }
            '=' => {
                if self.match_and_advance('>') {
                    self.make_lexeme(FatArrow)
                } else {
                    self.one_of('=', EqualEqual, Equal)
                }
            }
            '<' => {
                if self.match_and_advance('<') {
                    self.one_of('=', ShiftLeftEqual, ShiftLeft)
                } else {
                    self.one_of('=', LessEqual, Less)
                }
            }
            '>' => {
                if self.match_and_advance('>') {
                    self.one_of('=', ShiftRightEqual, ShiftRight)
                } else {
                    self.one_of('=', GreaterEqual, Greater)
                }
            }
            '"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    /// Returns `true` if we've reached the end of the source code.
    pub fn is_at_end(&self) -> bool {
        self.current.is_empty()
    }

    /// Advances self.current, s.t., self.start < self.current are a reference to the same str.
    /// Returns the next valid char.
    ///
    /// # Panics
    ///
    /// If this is called at the end of string.
    fn advance(&mut self) -> char {
        let c = match self.current.chars().next() {
            Some(c) => c,
            None => panic!("called advance() at end of file"),
        };

        self.current = &self.current[c.len_utf8()..];
        c
    }

    /// Peek at the first char in self.current.
    fn peek(&self) -> char {
        self.current.chars().next().unwrap_or('\0')
    }

    /// Peek at the second char in self.current.
    fn peek_next(&self) -> char {
        let mut chars = self.current.chars();
        chars.next();
        chars.next().unwrap_or('\0')
    }

    /// Matches the expected character. If the next character matches, returns true and advances
    /// self.current. Otherwise, return false and does not update anything.
    fn match_and_advance(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }

        self.current = &self.current[expected.len_utf8()..];
        true
    }

    /// Makes `long` if the next character is `next`, and `short` otherwise.
    fn one_of(&mut self, next: char, long: Token, short: Token) -> Lexeme<'a> {
        let token = if self.match_and_advance(next) {
            long
        } else {
            short
        };
        self.make_lexeme(token)
    }

    /// Skips whitespace and comments. Fails on an unterminated block comment.
    fn skip_whitespace(&mut self) -> Result<(), &'static str> {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    // Count the newline
                    self.line += 1;
                    self.advance();
                }
                // Comments are "whitespace"
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                }
                '/' if self.peek_next() == '*' => {
                    self.start = self.current;
                    self.advance();
                    self.advance();
                    loop {
                        if self.is_at_end() {
                            return Err("Unterminated block comment.");
                        }
                        match self.advance() {
                            '*' if self.match_and_advance('/') => break,
                            '\n' => self.line += 1,
                            _ => {}
                        }
                    }
                }
                _ => return Ok(()),
            };
        }
    }

    /// Scan an identifier or keyword.
    fn identifier(&mut self) -> Lexeme<'a> {
        while is_id_continue(self.peek()) {
            self.advance();
        }

        self.make_lexeme(self.identifier_type())
    }

    /// Scan a string literal. Expects the starting quote to have been consumed.
    fn string(&mut self) -> Lexeme<'a> {
        while self.peek() != '"' && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        // The closing quote.
        self.advance();
        self.make_lexeme(Token::StrLiteral)
    }

    /// Scan a number literal. Expects the first digit to have already been consumed.
    fn number(&mut self) -> Lexeme<'a> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            // Consume the decimal point
            self.advance();

            // Consume the digits after the decimal point
            while self.peek().is_ascii_digit() {
                self.advance();
            }
            return self.make_lexeme(Token::F64Literal);
        }

        match self.lexeme_text().parse::<i64>() {
            Ok(n) if n <= i32::MAX as i64 => self.make_lexeme(Token::I32Literal),
            Ok(_) => self.make_lexeme(Token::I64Literal),
            Err(_) => self.error_token("Integer literal is too large."),
        }
    }

    /// Check if the identifier is a keyword, or a normal identifier.
    fn identifier_type(&self) -> Token {
        let mut chars = self.start.chars();

        match chars.next().unwrap_or('\0') {
            '_' => self.check_keyword("_", Token::Underscore),
            'a' => self.check_keyword("and", Token::And),
            'b' => self.check_keyword("break", Token::Break),
            'c' => match chars.next().unwrap_or('\0') {
                'l' => self.check_keyword("class", Token::Class),
                'o' => self.check_keyword("continue", Token::Continue),
                _ => Token::Identifier,
            },
            'e' => match chars.next().unwrap_or('\0') {
                'l' => self.check_keyword("else", Token::Else),
                'n' => self.check_keyword("enum", Token::Enum),
                _ => Token::Identifier,
            },
            'f' => match chars.next().unwrap_or('\0') {
                'a' => self.check_keyword("false", Token::False),
                'n' => self.check_keyword("fn", Token::Fn),
                'o' => self.check_keyword("for", Token::For),
                _ => Token::Identifier,
            },
            'i' => self.check_keyword("if", Token::If),
            'l' => self.check_keyword("loop", Token::Loop),
            'm' => self.check_keyword("match", Token::Match),
            'N' => self.check_keyword("None", Token::NoneKeyword),
            'o' => self.check_keyword("or", Token::Or),
            'r' => self.check_keyword("return", Token::Return),
            's' => match chars.next().unwrap_or('\0') {
                'e' => self.check_keyword("self", Token::SelfKeyword),
                't' => self.check_keyword("struct", Token::Struct),
                'u' => self.check_keyword("super", Token::Super),
                _ => Token::Identifier,
            },
            't' => self.check_keyword("true", Token::True),
            'v' => self.check_keyword("var", Token::Var),
            'w' => self.check_keyword("while", Token::While),
            _ => Token::Identifier,
        }
    }

    /// Confirms that the current lexeme is a keyword or lexeme.
    fn check_keyword(&self, keyword_text: &'static str, keyword: Token) -> Token {
        if self.lexeme_text() == keyword_text {
            keyword
        } else {
            Token::Identifier
        }
    }

    /// The text between self.start and self.current.
    fn lexeme_text(&self) -> &'a str {
        let extent = self.start.len() - self.current.len();
        &self.start[..extent]
    }

    /// Returns an lexeme with [Token::Error] as its token.
    fn error_token(&self, message: &'static str) -> Lexeme<'a> {
        Lexeme {
            token: Token::Error,
            text: message,
            line: self.line,
        }
    }

    /// Returns a [Lexeme] from the span between self.start and self.current with the given
    /// [Token].
    fn make_lexeme(&self, token: Token) -> Lexeme<'a> {
        Lexeme {
            token,
            text: self.lexeme_text(),
            line: self.line,
        }
    }
}

impl<'a> Iterator for Scanner<'a> {
    type Item = Lexeme<'a>;

    fn next(&mut self) -> Option<Lexeme<'a>> {
        Some(self.scan_token())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // This iterator is infinite.
        (usize::MAX, None)
    }
}

impl<'a> Lexeme<'a> {
    /// A lexeme that does not come from the source, such as the implicit `self`.
    pub fn synthetic(text: &'a str) -> Self {
        Lexeme {
            token: Token::Identifier,
            text,
            line: 0,
        }
    }

    /// Return the line number this token was found on.
    pub fn line(&self) -> usize {
        self.line
    }

    /// Return the literal text of this token. For string literals, this always includes the
    /// quotes.
    pub fn text(&self) -> &'a str {
        self.text
    }

    /// Return the [Token] of this lexeme.
    pub fn token(&self) -> Token {
        self.token
    }
}

///////////////////////////////////////////// Helpers /////////////////////////////////////////////

/// Returns true if this char can start an identifier or keyword.
fn is_id_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Returns true if this char can be used after the first character of an identifier or keyword.
fn is_id_continue(c: char) -> bool {
    is_id_start(c) || c.is_ascii_digit()
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source)
            .into_iter()
            .map(|lexeme| lexeme.token())
            .collect()
    }

    #[test]
    fn scanning_every_keyword() {
        use Token::*;

        let source_code = "class classic : Base {
            fn fnord(self_ish) -> None {
                if ifree and anders or orvile {
                    break; breakfast; continue; continuum;
                } else {
                    for (former = 0; former < 10; former += 1) {
                        Nonesuch = None;
                    }
                    super.falseFlag = truede;
                    self.selfie = true;
                    loop { looping; }
                    return returned;
                }
                var varied;
                while whileLoop {
                    match matched { _ => 0, }
                }
            }
        }
        struct structure {}
        enum enumerate {}";

        #[rustfmt::skip]
        let expected_tokens = vec![
            Class, Identifier, Colon, Identifier, LeftBrace,
                Fn, Identifier, LeftParen, Identifier, RightParen, Arrow, NoneKeyword, LeftBrace,
                    If, Identifier, And, Identifier, Or, Identifier, LeftBrace,
                        Break, Semicolon, Identifier, Semicolon, Continue, Semicolon, Identifier, Semicolon,
                    RightBrace, Else, LeftBrace,
                        For, LeftParen, Identifier, Equal, I32Literal, Semicolon, Identifier, Less, I32Literal, Semicolon, Identifier, PlusEqual, I32Literal, RightParen, LeftBrace,
                            Identifier, Equal, NoneKeyword, Semicolon,
                        RightBrace,
                        Super, Dot, Identifier, Equal, Identifier, Semicolon,
                        SelfKeyword, Dot, Identifier, Equal, True, Semicolon,
                        Loop, LeftBrace, Identifier, Semicolon, RightBrace,
                        Return, Identifier, Semicolon,
                    RightBrace,
                    Var, Identifier, Semicolon,
                    While, Identifier, LeftBrace,
                        Match, Identifier, LeftBrace, Underscore, FatArrow, I32Literal, Comma, RightBrace,
                    RightBrace,
                RightBrace,
            RightBrace,
            Struct, Identifier, LeftBrace, RightBrace,
            Enum, Identifier, LeftBrace, RightBrace,
            Eof,
        ];

        assert_eq!(expected_tokens, tokens(source_code));
    }

    #[test]
    fn operators_use_maximal_munch() {
        use Token::*;
        assert_eq!(
            vec![
                ShiftLeftEqual, ShiftLeft, LessEqual, Less, ShiftRightEqual, ShiftRight,
                GreaterEqual, Greater, Layer, Colon, Arrow, MinusEqual, Minus, FatArrow,
                EqualEqual, Equal, BangEqual, Bang, Tilde, Equal, Tilde, PipeEqual, Pipe,
                AmpersandEqual, Ampersand, CaretEqual, Caret, PercentEqual, Percent, SlashEqual,
                Slash, StarEqual, Star, Eof,
            ],
            tokens("<<= << <= < >>= >> >= > :: : -> -= - => == = != ! ~= ~ |= | &= & ^= ^ %= % /= / *= *")
        );
    }

    #[test]
    fn number_literals() {
        use Token::*;
        assert_eq!(
            vec![I32Literal, I64Literal, F64Literal, I32Literal, Dot, Identifier, Eof],
            tokens("2147483647 2147483648 3.25 1.foo")
        );

        let too_big = tokenize("99999999999999999999");
        assert_eq!(Error, too_big[0].token());
        assert_eq!("Integer literal is too large.", too_big[0].text());
    }

    #[test]
    fn strings_and_comments() {
        let lexemes = tokenize("\"multi\nline\" // comment\n/* block\n comment */ x");
        assert_eq!(Token::StrLiteral, lexemes[0].token());
        assert_eq!("\"multi\nline\"", lexemes[0].text());
        assert_eq!(2, lexemes[0].line());
        assert_eq!(Token::Identifier, lexemes[1].token());
        assert_eq!(4, lexemes[1].line());
    }

    #[test]
    fn scan_errors() {
        let unterminated = tokenize("\"oops");
        assert_eq!(Token::Error, unterminated[0].token());
        assert_eq!("Unterminated string.", unterminated[0].text());

        let comment = tokenize("/* never closed");
        assert_eq!(Token::Error, comment[0].token());
        assert_eq!("Unterminated block comment.", comment[0].text());

        let unexpected = tokenize("@");
        assert_eq!("Unexpected character.", unexpected[0].text());
        assert_eq!(Token::Eof, unexpected[1].token());
    }

    #[test]
    fn lone_underscore_is_a_wildcard() {
        use Token::*;
        assert_eq!(vec![Underscore, Identifier, Identifier, Eof], tokens("_ _x x_"));
    }
}
