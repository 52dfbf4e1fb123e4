//! Runtime errors
//!
//! Limit violations are fatal to the fiber tree that triggered them and are
//! surfaced to the caller of `execute`/`advance`. Stale entity or target
//! references are not errors: they are handled structurally through
//! generation counters (self-termination, default-target fallback).

use thiserror::Error;

/// Runtime result type
pub type Result<T> = std::result::Result<T, Error>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("fiber executed more than {limit} instructions in one tick; missing wait command?")]
    MissingWait { limit: usize },

    #[error("call nesting deeper than the limit of {limit}")]
    NestingTooDeep { limit: usize },

    #[error("corrupt program: {0}")]
    CorruptProgram(&'static str),
}
