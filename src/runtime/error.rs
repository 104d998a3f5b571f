//! Error types for the Tandem runtime
//!
//! Corruption faults share a common taxonomy and are never recovered
//! internally: they are caught once at the top of dispatch and handed to the
//! pluggable failure handler. Accessor misuse gets its own layer so handlers
//! see precise diagnostics for registry mistakes.

use thiserror::Error;

/// A divergence detected between the two executions or the two state copies.
///
/// Every variant means some part of the process — state, message, handler
/// control flow or the engine's own configuration — no longer agrees with its
/// redundant copy. None of these are recoverable locally: acting on either
/// copy after a disagreement would act on possibly-corrupted data.
#[derive(Debug, Clone, Error)]
pub enum CorruptionError {
    /// Scalar or keyed value mismatch between primary and replica storage,
    /// or a mismatch between the engine's paired protection flags.
    #[error("variable '{field}' differs: value {value}, replica {replica}")]
    Variable {
        /// Field (or flag) name
        field: String,
        /// Value observed on this side
        value: String,
        /// Value observed on the counterpart side
        replica: String,
    },

    /// Write/read symmetry violated between the strict and light executions.
    #[error("asymmetrical changes to '{field}': key {key:?}, replica key {replica_key:?}")]
    AsymmetricalChanges {
        /// Field name
        field: String,
        /// Key applied on the strict side, if any
        key: Option<String>,
        /// Key expected by the light side's read log, if any
        replica_key: Option<String>,
    },

    /// Descriptor lists diverged between the two executions.
    #[error("generated descriptors diverge: {primary} vs {shadow}")]
    MessagesGeneration {
        /// Descriptors produced by the primary execution
        primary: String,
        /// Descriptors produced by the shadow execution
        shadow: String,
    },

    /// Paired sentinel flags were not found in lockstep.
    #[error("control flow corrupted: {0}")]
    ControlFlow(String),

    /// The handler's guard predicate no longer holds after execution.
    #[error("guard predicate does not hold after handling: {message}")]
    Guard {
        /// Debug rendering of the offending message
        message: String,
    },

    /// The input message mutated, or failed verification, during handling.
    #[error("input message corrupted ({detail}): {message}")]
    InputMessage {
        /// What failed: equality with the clone, or verification
        detail: String,
        /// Debug rendering of the offending message
        message: String,
    },
}

/// Misuse of the accessor surface: unknown fields, kind or type mismatches.
///
/// These are programming errors rather than hardware faults, but they surface
/// mid-dispatch and are routed to the failure handler all the same — a
/// handler that names a field the layout does not declare cannot have its
/// effects verified.
#[derive(Debug, Clone, Error)]
pub enum AccessError {
    /// No field with this name in the state layout
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// Field is indexed but was accessed as a scalar
    #[error("field '{0}' is indexed, not a scalar")]
    NotScalar(String),

    /// Field is a scalar but was accessed with a key
    #[error("field '{0}' is a scalar, not indexed")]
    NotIndexed(String),

    /// Requested or supplied value type does not match the declared field type
    #[error("field '{field}' does not hold values of type {requested}")]
    TypeMismatch {
        /// Field name
        field: String,
        /// Type the caller requested or supplied
        requested: &'static str,
    },

    /// Supplied key type does not match the declared key type
    #[error("field '{field}' is not keyed by {requested}")]
    KeyTypeMismatch {
        /// Field name
        field: String,
        /// Key type the caller supplied
        requested: &'static str,
    },
}

/// Top-level runtime error
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Corruption detected during dispatch
    #[error("corruption detected: {0}")]
    Corruption(#[from] CorruptionError),

    /// Accessor surface misuse
    #[error("state access error: {0}")]
    Access(#[from] AccessError),

    /// Invalid state layout declaration
    #[error("invalid state layout: {0}")]
    Layout(String),

    /// Handler-level execution failure
    #[error("handler execution failed: {0}")]
    Execution(String),
}

impl RuntimeError {
    /// True if this error is one of the corruption kinds.
    pub fn is_corruption(&self) -> bool {
        matches!(self, RuntimeError::Corruption(_))
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_display_names_field() {
        let err = CorruptionError::Variable {
            field: "a".into(),
            value: "1".into(),
            replica: "2".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("'a'"));
        assert!(rendered.contains("replica 2"));
    }

    #[test]
    fn test_runtime_error_classification() {
        let corrupt: RuntimeError = CorruptionError::ControlFlow("cfs".into()).into();
        assert!(corrupt.is_corruption());

        let access: RuntimeError = AccessError::UnknownField("z".into()).into();
        assert!(!access.is_corruption());
    }
}
