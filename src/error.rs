//! Crate-wide error type.

use thiserror::Error;

use crate::il::Addr;

/// Failure modes of decoding and analysis.
///
/// Construction-time errors (malformed token patterns, inconsistent operand
/// widths) are surfaced to the caller. Transfer-time errors are recovered
/// locally by the drivers: the offending mnemonic or seed is skipped and a
/// diagnostic is logged. Invariant breaches abort the enclosing procedure's
/// analysis; the flow-graph driver carries on with other procedures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A token pattern string handed to the decoder could not be parsed.
    #[error("invalid token pattern at column {column}: '{pattern}'")]
    TokenPattern {
        /// The rejected pattern, verbatim.
        pattern: String,
        /// Zero-based column of the offending character.
        column: usize,
    },
    /// Operand widths of an instruction under construction are inconsistent.
    /// Aborts the current mnemonic without touching the block under assembly.
    #[error("operand width mismatch: {0}")]
    WidthMismatch(String),
    /// A seed address lies outside the program image. The seed is dropped.
    #[error("address {0:#x} lies outside the program image")]
    Boundary(Addr),
    /// An internal structural invariant does not hold. There is no recovery
    /// path; the procedure being analyzed is abandoned whole.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub(crate) fn width(msg: impl Into<String>) -> Self {
        Error::WidthMismatch(msg.into())
    }
}
