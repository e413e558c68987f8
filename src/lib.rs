/// cityvm — a persistent ES5-dialect virtual machine.
///
/// The whole runtime state (heap, scope chains, in-flight execution stack)
/// serializes to `.city` snapshot files and restores mid-expression.
///
/// Module layout:
///   - errors     — host-level error taxonomy (Span, lexer/parser/fatal/
///                  snapshot/configuration errors)
///   - ast        — typed syntax tree with dense, deterministic node ids
///   - lexer      — hand-written ES5 tokenizer
///   - parser     — recursive-descent parser, parse_expression_at variant
///   - value      — runtime values, coercions, four-way comparison
///   - heap       — object/scope arenas, property and binding semantics
///   - interp     — the explicit-stack stepper (step/run/pause/append_code)
///   - intrinsics — builtin library and the stable native-function registry
///   - snapshot   — whole-state serializer/deserializer, checkpoint files
///   - retention  — exponential-spacing snapshot deletion policy
///   - conf       — supervisor configuration (JSON)
///   - loader     — snapshot/startup-source discovery

pub mod ast;
pub mod conf;
pub mod errors;
pub mod heap;
pub mod interp;
pub mod intrinsics;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod retention;
pub mod snapshot;
pub mod value;

// ── Re-exports for convenience ───────────────────────────────────────────────
pub use conf::Conf;
pub use errors::{FatalError, ParseError, SnapshotError};
pub use heap::{Heap, LangError, ObjData, ObjRef, Scope, ScopeRef};
pub use interp::{Runtime, RunOutcome};
pub use parser::Parser;
pub use value::Value;
