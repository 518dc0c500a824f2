//! Shared error type for the toolbox.
//!
//! Configuration errors are reported before any iteration runs. Numerical
//! errors abort the current solve; the caller keeps whatever controller was
//! last committed. MRT errors never propagate into the optimizer.

use thiserror::Error;

/// Result alias used across the workspace.
pub type OcxResult<T> = Result<T, OcxError>;

#[derive(Debug, Error)]
pub enum OcxError {
    /// Invalid problem or settings, detected before iterating.
    #[error("configuration: {0}")]
    Config(String),

    /// The adaptive integrator diverged (step underflow or non-finite state).
    #[error("integrator diverged at t = {time:.6}: {reason}")]
    IntegratorDiverged { time: f64, reason: &'static str },

    /// A non-finite value appeared in a Riccati or rollout quantity.
    #[error("non-finite {what} at t = {time:.6}")]
    NonFinite { what: &'static str, time: f64 },

    /// The input-cost Hessian `Rm` could not be factorized.
    #[error("input cost Hessian is not positive definite at t = {time:.6}")]
    IllConditionedInputCost { time: f64 },

    /// The run was cancelled through its `CancelToken`.
    #[error("solve cancelled")]
    Cancelled,

    /// MRT query issued before any policy was committed.
    #[error("no policy has been committed yet")]
    NoPolicy,
}

impl OcxError {
    /// Convenience constructor for configuration errors.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
