//! The lexer: bytes to tokens in a single left-to-right scan.
//!
//! Newlines are significant (they terminate statements outside brackets)
//! and are emitted as tokens. Operators are matched greedy-longest over the
//! operator table. Block comments nest.

use crate::common::error::{CompileError, ErrorKind};
use crate::common::source::Position;

use super::operators;
use super::token::{Token, TokenKind, KEYWORDS};

pub struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    file: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, file: &'a str) -> Self {
        Self { input: input.as_bytes(), pos: 0, line: 1, column: 1, file }
    }

    /// Tokenize the whole input. Comments are included in the stream and
    /// filtered out by the caller before parsing.
    pub fn tokenize(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        while self.pos < self.input.len() {
            let position = self.position();
            let ch = self.input[self.pos];

            match ch {
                b'\n' => {
                    tokens.push(Token::new(TokenKind::Newline, "\n", position));
                    self.advance();
                }
                b' ' | b'\t' | b'\r' => self.advance(),
                b'(' => {
                    tokens.push(Token::new(TokenKind::GroupStart, "(", position));
                    self.advance();
                }
                b')' => {
                    tokens.push(Token::new(TokenKind::GroupEnd, ")", position));
                    self.advance();
                }
                b'{' => {
                    tokens.push(Token::new(TokenKind::BlockStart, "{", position));
                    self.advance();
                }
                b'}' => {
                    tokens.push(Token::new(TokenKind::BlockEnd, "}", position));
                    self.advance();
                }
                b',' => {
                    tokens.push(Token::new(TokenKind::Separator, ",", position));
                    self.advance();
                }
                b'"' => tokens.push(self.lex_text(position)?),
                b'/' if self.peek(1) == Some(b'/') => tokens.push(self.lex_line_comment(position)),
                b'/' if self.peek(1) == Some(b'*') => {
                    tokens.push(self.lex_block_comment(position)?)
                }
                b'.' if self.peek(1) == Some(b'.') => {
                    tokens.push(Token::new(TokenKind::Range, "..", position));
                    self.advance();
                    self.advance();
                }
                _ if ch.is_ascii_digit() => tokens.push(self.lex_number(position)),
                _ if ch == b'_' || ch.is_ascii_alphabetic() => {
                    tokens.push(self.lex_identifier(position))
                }
                _ => match self.lex_operator(position) {
                    Some(token) => tokens.push(token),
                    None => {
                        return Err(CompileError::new(
                            ErrorKind::UnknownCharacter(ch as char),
                            self.file,
                            position,
                        ))
                    }
                },
            }
        }

        Ok(tokens)
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn advance(&mut self) {
        if self.input[self.pos] == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        self.pos += 1;
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    fn lex_identifier(&mut self, position: Position) -> Token {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos] == b'_' || self.input[self.pos].is_ascii_alphanumeric())
        {
            self.advance();
        }

        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        let kind = if KEYWORDS.contains(&text) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };

        Token::new(kind, text, position)
    }

    fn lex_number(&mut self, position: Position) -> Token {
        let start = self.pos;

        // 0x prefix switches to hex digits
        if self.input[self.pos] == b'0' && self.peek(1) == Some(b'x') {
            self.advance();
            self.advance();
            while self.pos < self.input.len() && self.input[self.pos].is_ascii_hexdigit() {
                self.advance();
            }
        } else {
            while self.pos < self.input.len() && self.input[self.pos].is_ascii_digit() {
                self.advance();
            }
        }

        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        Token::new(TokenKind::Number, text, position)
    }

    fn lex_text(&mut self, position: Position) -> Result<Token, CompileError> {
        self.advance(); // opening quote
        let mut text = String::new();

        loop {
            let Some(ch) = self.peek(0) else {
                return Err(CompileError::new(ErrorKind::UnterminatedText, self.file, position));
            };

            match ch {
                b'"' => {
                    self.advance();
                    return Ok(Token::new(TokenKind::Text, text, position));
                }
                b'\n' => {
                    return Err(CompileError::new(ErrorKind::UnterminatedText, self.file, position))
                }
                b'\\' => {
                    self.advance();
                    let escaped = match self.peek(0) {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'\\') => '\\',
                        Some(b'"') => '"',
                        Some(other) => other as char,
                        None => {
                            return Err(CompileError::new(
                                ErrorKind::UnterminatedText,
                                self.file,
                                position,
                            ))
                        }
                    };
                    text.push(escaped);
                    self.advance();
                }
                _ => {
                    text.push(ch as char);
                    self.advance();
                }
            }
        }
    }

    fn lex_line_comment(&mut self, position: Position) -> Token {
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos] != b'\n' {
            self.advance();
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        Token::new(TokenKind::Comment, text, position)
    }

    /// Block comments nest: `/* a /* b */ c */` is one comment.
    fn lex_block_comment(&mut self, position: Position) -> Result<Token, CompileError> {
        let start = self.pos;
        self.advance();
        self.advance();
        let mut depth = 1u32;

        while depth > 0 {
            match (self.peek(0), self.peek(1)) {
                (Some(b'/'), Some(b'*')) => {
                    depth += 1;
                    self.advance();
                    self.advance();
                }
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.advance();
                    self.advance();
                }
                (Some(_), _) => self.advance(),
                (None, _) => {
                    return Err(CompileError::new(
                        ErrorKind::MissingCharacter('/'),
                        self.file,
                        position,
                    ))
                }
            }
        }

        let text = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        Ok(Token::new(TokenKind::Comment, text, position))
    }

    fn lex_operator(&mut self, position: Position) -> Option<Token> {
        for op in operators::LEXER_OPERATORS {
            if self.input[self.pos..].starts_with(op.as_bytes()) {
                for _ in 0..op.len() {
                    self.advance();
                }
                let priority = operators::priority(op).unwrap_or(0);
                return Some(Token::operator(*op, priority, position));
            }
        }
        None
    }
}

/// Tokenize `input`, dropping comment tokens.
pub fn tokenize(input: &str, file: &str) -> Result<Vec<Token>, CompileError> {
    let tokens = Lexer::new(input, file).tokenize()?;
    Ok(tokens.into_iter().filter(|t| t.kind != TokenKind::Comment).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input, "test.q").unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn basic_function() {
        assert_eq!(
            kinds("fn main() {\n}\n"),
            vec![
                TokenKind::Keyword,
                TokenKind::Identifier,
                TokenKind::GroupStart,
                TokenKind::GroupEnd,
                TokenKind::BlockStart,
                TokenKind::Newline,
                TokenKind::BlockEnd,
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn greedy_longest_operators() {
        let tokens = tokenize("a >>= 1\nb >> c\nd > e", "test.q").unwrap();
        let ops: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Operator)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec![">>=", ">>", ">"]);
    }

    #[test]
    fn operator_priorities() {
        let tokens = tokenize("a = b + c * d", "test.q").unwrap();
        let priorities: Vec<u8> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Operator)
            .map(|t| t.priority)
            .collect();
        assert_eq!(priorities, vec![2, 7, 8]);
    }

    #[test]
    fn numbers() {
        let tokens = tokenize("42 0x2A", "test.q").unwrap();
        assert_eq!(tokens[0].text, "42");
        assert_eq!(tokens[1].text, "0x2A");
        assert!(tokens.iter().all(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn text_escapes() {
        let tokens = tokenize(r#""a\nb\t\"c\"\\""#, "test.q").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Text);
        assert_eq!(tokens[0].text, "a\nb\t\"c\"\\");
    }

    #[test]
    fn unterminated_text() {
        let err = tokenize("\"abc", "test.q").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnterminatedText);
    }

    #[test]
    fn range_token() {
        let tokens = tokenize("0..10", "test.q").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::Range);
    }

    #[test]
    fn comments_are_dropped() {
        let tokens = tokenize("a // comment\nb /* x /* nested */ y */ c", "test.q").unwrap();
        let idents: Vec<&str> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Identifier)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(idents, vec!["a", "b", "c"]);
    }

    #[test]
    fn positions() {
        let tokens = tokenize("a\n  b", "test.q").unwrap();
        assert_eq!(tokens[0].position, Position::new(1, 1));
        assert_eq!(tokens[2].position, Position::new(2, 3));
    }

    #[test]
    fn unknown_character() {
        let err = tokenize("a ~ b", "test.q").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownCharacter('~'));
        assert_eq!(err.position, Position::new(1, 3));
    }

    #[test]
    fn printing_tokens_preserves_semantics() {
        let source = "fn main() {\n\tfor i = 0..3 {\n\t\tx := i * 2 + 1\n\t\tsyscall(60, x)\n\t}\n}\n";
        let tokens = tokenize(source, "test.q").unwrap();

        // Re-print with uniform whitespace and tokenize again: kinds and
        // texts survive, only layout changes.
        let printed: String =
            tokens.iter().map(|t| format!("{} ", t.text)).collect();
        let reparsed = tokenize(&printed, "test.q").unwrap();

        let shape: Vec<(TokenKind, &str)> =
            tokens.iter().map(|t| (t.kind, t.text.as_str())).collect();
        let reshape: Vec<(TokenKind, &str)> =
            reparsed.iter().map(|t| (t.kind, t.text.as_str())).collect();
        assert_eq!(shape, reshape);
    }
}
