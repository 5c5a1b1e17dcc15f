// This module defines the error taxonomy of the emission core using the thiserror crate.
// EncodingError is raised by an Assembler while it writes or patches bytes; the interesting
// variant is BranchTargetOutOfBounds, the one failure the driver recovers from by re-emitting
// the whole unit in conservative mode. EmitError is what the builder surfaces: encoding
// range violations pass through unchanged, unexpected failures are wrapped as Internal errors that
// carry an ErrorContext (block id, instruction id and class, pretty-printed instruction),
// Contract errors flag bugs in an upstream collaborator, and Bailout signals raised outside
// this core are propagated verbatim and never wrapped.

//! Error types for LIR code emission.

use std::fmt;
use thiserror::Error;

use super::lir::Label;
use super::register::AsmReg;

/// Failure while encoding or patching machine code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("branch target out of bounds: displacement {displacement} at {position} does not fit in {bits} bits")]
    BranchTargetOutOfBounds {
        position: u32,
        displacement: i64,
        bits: u8,
    },

    #[error("label {0} is already bound")]
    LabelAlreadyBound(Label),

    #[error("label {0} is referenced but was never bound")]
    UnboundLabel(Label),

    #[error("register {reg:?} cannot be used for {operation}")]
    InvalidRegister {
        reg: AsmReg,
        operation: &'static str,
    },

    #[error("immediate {value} out of range for {operation}")]
    ImmediateOutOfRange {
        value: i64,
        operation: &'static str,
    },

    #[error("invalid alignment {0}")]
    InvalidAlignment(u32),

    /// Rejected by the target instruction encoder.
    #[error("assembly error: {0}")]
    Assembly(String),
}

/// Ordered key/value annotations attached to an internal error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    entries: Vec<(String, String)>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            write!(f, "\n  {key}: {value}")?;
        }
        Ok(())
    }
}

/// Error surfaced by the compilation result builder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("internal error: {message}{context}")]
    Internal {
        message: String,
        context: ErrorContext,
    },

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("bailout: {0}")]
    Bailout(String),
}

impl EmitError {
    pub fn internal(message: impl Into<String>) -> Self {
        EmitError::Internal {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn contract(message: impl Into<String>) -> Self {
        EmitError::Contract(message.into())
    }

    pub fn bailout(message: impl Into<String>) -> Self {
        EmitError::Bailout(message.into())
    }

    /// True for the single recoverable failure: a branch whose displacement
    /// exceeds the range of the encoding chosen for it.
    pub fn is_range_violation(&self) -> bool {
        matches!(
            self,
            EmitError::Encoding(EncodingError::BranchTargetOutOfBounds { .. })
        )
    }

    pub fn is_bailout(&self) -> bool {
        matches!(self, EmitError::Bailout(_))
    }

    /// Turn an unexpected encoding failure into an internal error. Range
    /// violations, bailouts and contract errors keep their variant.
    pub fn into_internal(self) -> Self {
        match self {
            EmitError::Encoding(ref e) if !self.is_range_violation() => {
                EmitError::internal(e.to_string())
            }
            other => other,
        }
    }

    /// Append a context entry to an internal error. Other variants are
    /// returned untouched.
    pub fn add_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let EmitError::Internal { context, .. } = &mut self {
            context.push(key, value);
        }
        self
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            EmitError::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Result type alias for emission operations.
pub type EmitResult<T> = Result<T, EmitError>;
