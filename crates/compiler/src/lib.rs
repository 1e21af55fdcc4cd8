//! Quill compiler
//!
//! Source text goes in, a bytecode function object comes out — with no tree
//! in between. The scanner produces tokens on demand and the Pratt parser
//! emits instructions into the current function's chunk as it consumes
//! them; variable resolution, scope pops, and closure capture flags are all
//! decided at emit time.
//!
//! Compile errors are reported to stderr as they are found
//! (`[line N] Error at '...': message`) and [`compile`] returns `None` if
//! any occurred.

pub mod compiler;
pub mod scanner;

pub use compiler::compile;
pub use scanner::{Scanner, Token, TokenKind};
