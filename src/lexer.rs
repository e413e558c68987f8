/// Tokenizer for the ES5 dialect.
///
/// Hand-written char scanner. Regex literals are disambiguated from division
/// the usual way: a `/` starts a regex unless the previous significant token
/// could end an operand. Each token records whether a line terminator
/// preceded it, which the parser uses for semicolon insertion.

use crate::errors::{LexError, Span};
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum TokKind {
    // Keywords
    Var,
    Function,
    If,
    Else,
    While,
    Do,
    For,
    In,
    Return,
    Break,
    Continue,
    New,
    Delete,
    TypeOf,
    InstanceOf,
    Void,
    This,
    Null,
    True,
    False,
    Throw,
    Try,
    Catch,
    Finally,
    Switch,
    Case,
    Default,
    With,
    Debugger,

    // Literals
    Number(f64),
    Str(String),
    Regex { source: String, flags: String },
    Ident(String),

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Dot,
    Colon,
    Question,

    // Operators
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    ShlAssign,
    ShrAssign,
    UShrAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    EqEq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Shl,
    Shr,
    UShr,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    AndAnd,
    OrOr,
    Not,

    Eof,
}

#[derive(Debug, Clone)]
pub struct Tok {
    pub kind: TokKind,
    pub span: Span,
    /// True when at least one line terminator appeared since the previous
    /// token. Drives automatic semicolon insertion.
    pub newline_before: bool,
}

static KEYWORDS: Lazy<HashMap<&'static str, TokKind>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("var", TokKind::Var);
    m.insert("function", TokKind::Function);
    m.insert("if", TokKind::If);
    m.insert("else", TokKind::Else);
    m.insert("while", TokKind::While);
    m.insert("do", TokKind::Do);
    m.insert("for", TokKind::For);
    m.insert("in", TokKind::In);
    m.insert("return", TokKind::Return);
    m.insert("break", TokKind::Break);
    m.insert("continue", TokKind::Continue);
    m.insert("new", TokKind::New);
    m.insert("delete", TokKind::Delete);
    m.insert("typeof", TokKind::TypeOf);
    m.insert("instanceof", TokKind::InstanceOf);
    m.insert("void", TokKind::Void);
    m.insert("this", TokKind::This);
    m.insert("null", TokKind::Null);
    m.insert("true", TokKind::True);
    m.insert("false", TokKind::False);
    m.insert("throw", TokKind::Throw);
    m.insert("try", TokKind::Try);
    m.insert("catch", TokKind::Catch);
    m.insert("finally", TokKind::Finally);
    m.insert("switch", TokKind::Switch);
    m.insert("case", TokKind::Case);
    m.insert("default", TokKind::Default);
    m.insert("with", TokKind::With);
    m.insert("debugger", TokKind::Debugger);
    m
});

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    newline_pending: bool,
    /// Kind of the last significant token, for regex/division disambiguation.
    prev: Option<TokKind>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            newline_pending: false,
            prev: None,
        }
    }

    /// Tokenize the whole input, appending a trailing Eof token.
    pub fn tokenize(input: &str) -> Result<Vec<Tok>, LexError> {
        let mut lexer = Lexer::new(input);
        let mut toks = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let eof = tok.kind == TokKind::Eof;
            toks.push(tok);
            if eof {
                break;
            }
        }
        Ok(toks)
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.current() {
                Some(ch) if ch == '\n' || ch == '\r' => {
                    self.newline_pending = true;
                    self.advance();
                }
                Some(ch) if ch.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek(1) == Some('/') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek(1) == Some('*') => {
                    let start = self.pos;
                    self.advance();
                    self.advance();
                    loop {
                        match self.current() {
                            Some('*') if self.peek(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(ch) => {
                                if ch == '\n' {
                                    self.newline_pending = true;
                                }
                                self.advance();
                            }
                            None => {
                                return Err(LexError::UnterminatedComment {
                                    span: Span::new(start, self.pos),
                                })
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// True when the previous token can end an operand, which makes a
    /// following `/` a division sign rather than the start of a regex.
    fn prev_ends_operand(&self) -> bool {
        matches!(
            self.prev,
            Some(TokKind::Number(_))
                | Some(TokKind::Str(_))
                | Some(TokKind::Regex { .. })
                | Some(TokKind::Ident(_))
                | Some(TokKind::This)
                | Some(TokKind::Null)
                | Some(TokKind::True)
                | Some(TokKind::False)
                | Some(TokKind::RParen)
                | Some(TokKind::RBracket)
                | Some(TokKind::RBrace)
                | Some(TokKind::PlusPlus)
                | Some(TokKind::MinusMinus)
        )
    }

    fn next_token(&mut self) -> Result<Tok, LexError> {
        self.skip_trivia()?;
        let newline_before = self.newline_pending;
        self.newline_pending = false;
        let start = self.pos;

        let kind = match self.current() {
            None => TokKind::Eof,
            Some(ch) if ch.is_ascii_digit() => self.lex_number()?,
            Some('.') if self.peek(1).map_or(false, |c| c.is_ascii_digit()) => self.lex_number()?,
            Some('"') | Some('\'') => self.lex_string()?,
            Some(ch) if is_ident_start(ch) => self.lex_ident(),
            Some('/') if !self.prev_ends_operand() => self.lex_regex()?,
            Some(_) => self.lex_punct()?,
        };

        self.prev = Some(kind.clone());
        Ok(Tok {
            kind,
            span: Span::new(start, self.pos),
            newline_before,
        })
    }

    fn lex_ident(&mut self) -> TokKind {
        let start = self.pos;
        while let Some(ch) = self.current() {
            if is_ident_part(ch) {
                self.advance();
            } else {
                break;
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        match KEYWORDS.get(text.as_str()) {
            Some(kw) => kw.clone(),
            None => TokKind::Ident(text),
        }
    }

    fn lex_number(&mut self) -> Result<TokKind, LexError> {
        let start = self.pos;
        if self.current() == Some('0')
            && matches!(self.peek(1), Some('x') | Some('X'))
        {
            self.advance();
            self.advance();
            let digits = self.pos;
            while self.current().map_or(false, |c| c.is_ascii_hexdigit()) {
                self.advance();
            }
            let text: String = self.input[digits..self.pos].iter().collect();
            if text.is_empty() {
                return Err(LexError::InvalidNumber {
                    text: self.slice(start),
                    span: Span::new(start, self.pos),
                });
            }
            let n = u64::from_str_radix(&text, 16).map_err(|_| LexError::InvalidNumber {
                text: self.slice(start),
                span: Span::new(start, self.pos),
            })?;
            return Ok(TokKind::Number(n as f64));
        }

        while self.current().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.current() == Some('.') {
            self.advance();
            while self.current().map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.current().map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = self.slice(start);
        text.parse::<f64>()
            .map(TokKind::Number)
            .map_err(|_| LexError::InvalidNumber {
                text,
                span: Span::new(start, self.pos),
            })
    }

    fn lex_string(&mut self) -> Result<TokKind, LexError> {
        let start = self.pos;
        let quote = self.advance().unwrap();
        let mut out = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => {
                    return Err(LexError::UnterminatedString {
                        span: Span::new(start, self.pos),
                    })
                }
                Some(ch) if ch == quote => break,
                Some('\\') => match self.advance() {
                    None => {
                        return Err(LexError::UnterminatedString {
                            span: Span::new(start, self.pos),
                        })
                    }
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{0008}'),
                    Some('f') => out.push('\u{000C}'),
                    Some('v') => out.push('\u{000B}'),
                    Some('0') => out.push('\u{0000}'),
                    Some('x') => out.push(self.hex_escape(start, 2)?),
                    Some('u') => out.push(self.hex_escape(start, 4)?),
                    Some('\n') => {} // line continuation
                    Some(other) => out.push(other),
                },
                Some(ch) => out.push(ch),
            }
        }
        Ok(TokKind::Str(out))
    }

    fn hex_escape(&mut self, start: usize, len: usize) -> Result<char, LexError> {
        let mut code = 0u32;
        for _ in 0..len {
            let d = self
                .advance()
                .and_then(|c| c.to_digit(16))
                .ok_or(LexError::UnterminatedString {
                    span: Span::new(start, self.pos),
                })?;
            code = code * 16 + d;
        }
        Ok(char::from_u32(code).unwrap_or('\u{FFFD}'))
    }

    fn lex_regex(&mut self) -> Result<TokKind, LexError> {
        let start = self.pos;
        self.advance(); // opening /
        let body_start = self.pos;
        let mut in_class = false;
        loop {
            match self.current() {
                None | Some('\n') => {
                    return Err(LexError::UnterminatedRegex {
                        span: Span::new(start, self.pos),
                    })
                }
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some('[') => {
                    in_class = true;
                    self.advance();
                }
                Some(']') => {
                    in_class = false;
                    self.advance();
                }
                Some('/') if !in_class => break,
                Some(_) => {
                    self.advance();
                }
            }
        }
        let source: String = self.input[body_start..self.pos].iter().collect();
        self.advance(); // closing /
        let flags_start = self.pos;
        while self.current().map_or(false, is_ident_part) {
            self.advance();
        }
        let flags: String = self.input[flags_start..self.pos].iter().collect();
        Ok(TokKind::Regex { source, flags })
    }

    fn lex_punct(&mut self) -> Result<TokKind, LexError> {
        let start = self.pos;
        let ch = self.advance().unwrap();
        let one = |k| Ok(k);
        macro_rules! two {
            ($next:expr, $long:expr, $short:expr) => {
                if self.current() == Some($next) {
                    self.advance();
                    Ok($long)
                } else {
                    Ok($short)
                }
            };
        }
        match ch {
            '(' => one(TokKind::LParen),
            ')' => one(TokKind::RParen),
            '{' => one(TokKind::LBrace),
            '}' => one(TokKind::RBrace),
            '[' => one(TokKind::LBracket),
            ']' => one(TokKind::RBracket),
            ';' => one(TokKind::Semi),
            ',' => one(TokKind::Comma),
            '.' => one(TokKind::Dot),
            ':' => one(TokKind::Colon),
            '?' => one(TokKind::Question),
            '~' => one(TokKind::BitNot),
            '+' => {
                if self.current() == Some('+') {
                    self.advance();
                    Ok(TokKind::PlusPlus)
                } else {
                    two!('=', TokKind::PlusAssign, TokKind::Plus)
                }
            }
            '-' => {
                if self.current() == Some('-') {
                    self.advance();
                    Ok(TokKind::MinusMinus)
                } else {
                    two!('=', TokKind::MinusAssign, TokKind::Minus)
                }
            }
            '*' => two!('=', TokKind::StarAssign, TokKind::Star),
            '/' => two!('=', TokKind::SlashAssign, TokKind::Slash),
            '%' => two!('=', TokKind::PercentAssign, TokKind::Percent),
            '^' => two!('=', TokKind::XorAssign, TokKind::BitXor),
            '&' => {
                if self.current() == Some('&') {
                    self.advance();
                    Ok(TokKind::AndAnd)
                } else {
                    two!('=', TokKind::AndAssign, TokKind::BitAnd)
                }
            }
            '|' => {
                if self.current() == Some('|') {
                    self.advance();
                    Ok(TokKind::OrOr)
                } else {
                    two!('=', TokKind::OrAssign, TokKind::BitOr)
                }
            }
            '!' => {
                if self.current() == Some('=') {
                    self.advance();
                    two!('=', TokKind::StrictNotEq, TokKind::NotEq)
                } else {
                    Ok(TokKind::Not)
                }
            }
            '=' => {
                if self.current() == Some('=') {
                    self.advance();
                    two!('=', TokKind::StrictEq, TokKind::EqEq)
                } else {
                    Ok(TokKind::Assign)
                }
            }
            '<' => {
                if self.current() == Some('<') {
                    self.advance();
                    two!('=', TokKind::ShlAssign, TokKind::Shl)
                } else {
                    two!('=', TokKind::LtEq, TokKind::Lt)
                }
            }
            '>' => {
                if self.current() == Some('>') {
                    self.advance();
                    if self.current() == Some('>') {
                        self.advance();
                        two!('=', TokKind::UShrAssign, TokKind::UShr)
                    } else {
                        two!('=', TokKind::ShrAssign, TokKind::Shr)
                    }
                } else {
                    two!('=', TokKind::GtEq, TokKind::Gt)
                }
            }
            other => Err(LexError::UnexpectedCharacter {
                ch: other,
                span: Span::new(start, self.pos),
            }),
        }
    }

    fn slice(&self, start: usize) -> String {
        self.input[start..self.pos].iter().collect()
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokKind> {
        Lexer::tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_and_idents() {
        assert_eq!(
            kinds("var x = 0x1f + .5e2;"),
            vec![
                TokKind::Var,
                TokKind::Ident("x".into()),
                TokKind::Assign,
                TokKind::Number(31.0),
                TokKind::Plus,
                TokKind::Number(50.0),
                TokKind::Semi,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#"'a\nA'"#),
            vec![TokKind::Str("a\nA".into()), TokKind::Eof]
        );
    }

    #[test]
    fn regex_vs_division() {
        // After an identifier, / is division; after an operator it is a regex.
        assert_eq!(
            kinds("a / b"),
            vec![
                TokKind::Ident("a".into()),
                TokKind::Slash,
                TokKind::Ident("b".into()),
                TokKind::Eof,
            ]
        );
        assert_eq!(
            kinds("x = /ab+c/gi"),
            vec![
                TokKind::Ident("x".into()),
                TokKind::Assign,
                TokKind::Regex {
                    source: "ab+c".into(),
                    flags: "gi".into()
                },
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn newline_flag_set_for_asi() {
        let toks = Lexer::tokenize("a\nb").unwrap();
        assert!(!toks[0].newline_before);
        assert!(toks[1].newline_before);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            Lexer::tokenize("'abc"),
            Err(LexError::UnterminatedString { .. })
        ));
    }
}
