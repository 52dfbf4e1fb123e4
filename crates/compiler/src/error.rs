//! Compile errors
//!
//! A failed compile leaves the compiler context untouched; no labels from
//! the failed source are registered.

use thiserror::Error;

/// Compiler result type
pub type Result<T> = std::result::Result<T, CompileError>;

/// Compile errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unrecognized input near \"{near}\"")]
    UnknownToken { near: String },

    #[error("loop opened with [ but never closed")]
    UnclosedLoop,

    #[error("] without a matching [")]
    UnexpectedLoopEnd,

    #[error("block opened with {{ but never closed")]
    UnclosedBlock,

    #[error("}} without a matching {{")]
    UnexpectedBlockEnd,

    #[error("? must follow [ or :")]
    MisplacedCondition,

    #[error(": must follow ?")]
    MisplacedElse,

    #[error("label #{0} defined more than once")]
    DuplicateLabel(String),

    #[error("label #{0} must open a block")]
    LabelWithoutBlock(String),

    #[error("&{0} matches no label or registered command")]
    UndefinedReference(String),

    #[error("${0} matches no accessor")]
    UnknownAccessor(String),

    #[error("malformed formula near \"{near}\"")]
    MalformedFormula { near: String },

    #[error("arguments cannot appear here")]
    DanglingFormula,

    #[error("&{label} needs {required} arguments, {supplied} supplied")]
    TooFewArguments {
        label: String,
        required: usize,
        supplied: usize,
    },
}
