use crate::diagnostic::Diagnostic;
use crate::span::{Span, Spanned};

/// Tokens of the graph text format.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Colon,
    Comma,
    LBracket,
    RBracket,
    Eq,
    Newline,
    Eof,
}

impl Token {
    pub fn description(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Int(n) => format!("integer {}", n),
            Token::Float(v) => format!("number {}", v),
            Token::Colon => "':'".to_string(),
            Token::Comma => "','".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Eq => "'='".to_string(),
            Token::Newline => "end of line".to_string(),
            Token::Eof => "end of file".to_string(),
        }
    }
}

pub struct Lexer<'src> {
    source: &'src [u8],
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'.'
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source: source.as_bytes(),
            pos: 0,
            diagnostics: Vec::new(),
        }
    }

    /// All tokens up to and including `Eof`. Consecutive blank lines
    /// collapse into one `Newline`.
    pub fn tokenize(mut self) -> (Vec<Spanned<Token>>, Vec<Diagnostic>) {
        let mut tokens: Vec<Spanned<Token>> = Vec::new();
        loop {
            let tok = self.next_token();
            let is_eof = tok.node == Token::Eof;
            let blank = tok.node == Token::Newline
                && tokens.last().map_or(true, |t| t.node == Token::Newline);
            if !blank {
                tokens.push(tok);
            }
            if is_eof {
                break;
            }
        }
        (tokens, self.diagnostics)
    }

    fn make(&self, token: Token, start: usize) -> Spanned<Token> {
        Spanned::new(token, Span::new(start as u32, self.pos as u32))
    }

    fn next_token(&mut self) -> Spanned<Token> {
        loop {
            self.skip_blanks_and_comments();
            let start = self.pos;
            let Some(&ch) = self.source.get(self.pos) else {
                return self.make(Token::Eof, start);
            };

            if is_ident_start(ch) {
                while self.source.get(self.pos).is_some_and(|&c| is_ident_continue(c)) {
                    self.pos += 1;
                }
                let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
                return self.make(Token::Ident(text), start);
            }

            let negative_number = ch == b'-'
                && self
                    .source
                    .get(self.pos + 1)
                    .is_some_and(|c| c.is_ascii_digit() || *c == b'i');
            if ch.is_ascii_digit() || negative_number {
                if let Some(tok) = self.scan_number(start) {
                    return tok;
                }
                continue;
            }

            self.pos += 1;
            let token = match ch {
                b'\n' => Token::Newline,
                b':' => Token::Colon,
                b',' => Token::Comma,
                b'[' => Token::LBracket,
                b']' => Token::RBracket,
                b'=' => Token::Eq,
                _ => {
                    self.diagnostics.push(Diagnostic::error(
                        format!("unexpected character '{}'", ch as char),
                        Span::new(start as u32, self.pos as u32),
                    ));
                    continue;
                }
            };
            return self.make(token, start);
        }
    }

    fn skip_blanks_and_comments(&mut self) {
        while let Some(&ch) = self.source.get(self.pos) {
            if ch == b'#' {
                while self.source.get(self.pos).is_some_and(|&c| c != b'\n') {
                    self.pos += 1;
                }
            } else if ch != b'\n' && ch.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// `-?digits(.digits)?(e-?digits)?`, or `-inf`.
    fn scan_number(&mut self, start: usize) -> Option<Spanned<Token>> {
        if self.source[self.pos] == b'-' {
            self.pos += 1;
            if self.source[self.pos..].starts_with(b"inf") {
                self.pos += 3;
                return Some(self.make(Token::Float(f64::NEG_INFINITY), start));
            }
        }
        let mut float = false;
        while let Some(&c) = self.source.get(self.pos) {
            match c {
                b'0'..=b'9' => {}
                b'.' | b'e' | b'E' => float = true,
                b'-' | b'+' if matches!(self.source[self.pos - 1], b'e' | b'E') => {}
                _ => break,
            }
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.source[start..self.pos]).into_owned();
        let token = if float {
            text.parse::<f64>().ok().map(Token::Float)
        } else {
            text.parse::<i64>().ok().map(Token::Int)
        };
        if token.is_none() {
            self.diagnostics.push(Diagnostic::error(
                format!("malformed number '{}'", text),
                Span::new(start as u32, self.pos as u32),
            ));
        }
        token.map(|t| self.make(t, start))
    }
}
