/// cityvm error types
///
/// Two layers exist at runtime. Language-level errors (TypeError, RangeError,
/// and friends) are heap objects thrown through the interpreter's unwind path
/// and are catchable by user code — they never appear here. This module holds
/// only host-level failures: lexing/parsing of source text, unrecoverable
/// interpreter conditions, snapshot I/O, and configuration loading.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span { start: 0, end: 0 }
    }
}

/// Compute a 1-based (line, column) pair for an error offset.
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in src.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

// ---------------------------------------------------------------------------
// Lexer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum LexError {
    #[error("unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },
    #[error("unterminated regular expression literal")]
    UnterminatedRegex { span: Span },
    #[error("unterminated block comment")]
    UnterminatedComment { span: Span },
    #[error("invalid number literal '{text}'")]
    InvalidNumber { text: String, span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedRegex { span }
            | LexError::UnterminatedComment { span }
            | LexError::InvalidNumber { span, .. } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("unexpected end of input ({context})")]
    UnexpectedEof { context: String, span: Span },
    #[error("invalid syntax: {message}")]
    InvalidSyntax { message: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::Lex(e) => e.span(),
            ParseError::UnexpectedToken { span, .. }
            | ParseError::UnexpectedEof { span, .. }
            | ParseError::InvalidSyntax { span, .. } => *span,
        }
    }
}

// ---------------------------------------------------------------------------
// Fatal interpreter errors
// ---------------------------------------------------------------------------

/// Unrecoverable conditions that propagate out of the step loop. User code
/// cannot catch these; they indicate either malformed input reaching the
/// stepper or a supervisor-level problem.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("syntax error in {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: ParseError,
    },
    #[error("illegal {kind} statement: no matching enclosing frame")]
    BadJump { kind: &'static str },
    #[error("with statements are not supported")]
    WithStatement,
    #[error("uncaught {what}")]
    Uncaught { what: String },
    #[error("interpreter state corrupted: {0}")]
    Corrupt(&'static str),
}

// ---------------------------------------------------------------------------
// Snapshot errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot is not well-formed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed snapshot record {index}: {message}")]
    BadRecord { index: usize, message: String },
    #[error("snapshot requires native function '{name}' which this build does not provide")]
    UnknownNative { name: String },
    #[error("snapshot source {index} no longer parses: {source}")]
    StaleSource {
        index: usize,
        #[source]
        source: ParseError,
    },
    #[error("unsupported snapshot format version {0}")]
    BadVersion(u32),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("cannot read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("database directory '{path}' does not exist")]
    MissingDirectory { path: PathBuf },
}
