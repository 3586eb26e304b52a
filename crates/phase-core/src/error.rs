//! Error type shared by every crate in the workspace.

use thiserror::Error;

/// Errors raised while configuring or running the classifier.
///
/// Configuration and shape errors surface immediately to the caller.
/// A forward pass either completes for the whole batch or fails.
///
/// # Example
///
/// ```
/// use phase_core::PhaseError;
///
/// let err = PhaseError::IndivisibleHidden { hidden_dim: 10, levels: 4 };
/// assert!(err.to_string().contains("10"));
/// ```
#[derive(Debug, Error)]
pub enum PhaseError {
    /// `hidden_dim` cannot be split into `levels` equal chunks.
    #[error("hidden_dim {hidden_dim} is not divisible by levels {levels}")]
    IndivisibleHidden { hidden_dim: usize, levels: usize },

    /// A configuration field holds an unusable value.
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A tensor or buffer did not have the expected shape.
    #[error("{context}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// An operation received no data at all.
    #[error("{context}: input is empty")]
    EmptyInput { context: &'static str },

    /// Input data is well-shaped but semantically unusable.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// Reading or parsing a configuration failed.
    #[error("config error: {message}")]
    Config { message: String },

    /// A tensor operation failed inside the numeric backend.
    #[error("{context}: tensor error: {message}")]
    Tensor { context: &'static str, message: String },

    /// Internal invariant broken (should not happen).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PhaseError {
    /// Builds a [`PhaseError::ShapeMismatch`] from two dimension slices.
    pub fn shape(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
