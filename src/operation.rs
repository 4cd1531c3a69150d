//! Per work item failure type and settings shared by every backend-facing
//! phase.

use thiserror::Error;

use crate::retry::RetryPolicy;

/// Knobs every backend-facing phase honours.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Maximum number of work items in flight at once.
    pub concurrency_limit: usize,
    /// Retry policy applied to each backend call.
    pub retry: RetryPolicy,
}

impl RunSettings {
    /// Builds settings, clamping the concurrency limit to at least one.
    #[must_use]
    pub fn new(concurrency_limit: usize, retry: RetryPolicy) -> Self {
        Self {
            concurrency_limit: concurrency_limit.max(1),
            retry,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::new(4, RetryPolicy::default())
    }
}

/// Failure of a single unit of work (one master, one clone, one segment).
///
/// These errors are collected into phase reports keyed by entity rather than
/// aborting sibling work.
#[derive(Debug, Error)]
pub enum OperationError<E>
where
    E: std::error::Error + 'static,
{
    /// The backend rejected the operation with a non-retriable error.
    #[error("{operation} failed: {source}")]
    Backend {
        /// Operation that failed (for example `clone kali-master`).
        operation: String,
        /// Backend error.
        #[source]
        source: E,
    },
    /// A transient error persisted past the retry ceiling.
    #[error("{operation} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Operation that failed.
        operation: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Last transient error observed.
        #[source]
        source: E,
    },
    /// A prerequisite did not reach the required state first.
    #[error("{resource} cannot proceed: {requirement}")]
    DependencyUnmet {
        /// Resource whose work item was refused.
        resource: String,
        /// Prerequisite that was missing.
        requirement: String,
    },
    /// A resource with the expected name exists but does not match the plan.
    #[error("{resource} exists but {detail}")]
    Mismatch {
        /// Resource path.
        resource: String,
        /// Description of the mismatch.
        detail: String,
    },
    /// Cancellation arrived before the work item started.
    #[error("cancelled before {operation} started")]
    Cancelled {
        /// Operation that never started.
        operation: String,
    },
    /// The task running the work item panicked or was aborted.
    #[error("{operation} stopped unexpectedly: {detail}")]
    Aborted {
        /// Operation that was running.
        operation: String,
        /// Panic or abort description.
        detail: String,
    },
}

impl<E> OperationError<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether the failure came from cancellation rather than a
    /// backend or ordering problem.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
