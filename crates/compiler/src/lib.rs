//! CML compiler
//!
//! Turns CML source text into the instruction graph interpreted by
//! `cml-runtime`. Compilation is all-or-nothing: a source that fails
//! anywhere produces no program and registers no labels.
//!
//! The entry point is [`CompilerContext::compile`]. A context persists
//! across compiles so labeled sequences from earlier scripts stay callable
//! by `&name`.

pub mod context;
pub mod error;
pub mod expr;
pub mod lexer;
pub mod parse;

pub use context::CompilerContext;
pub use error::{CompileError, Result};
