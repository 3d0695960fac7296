//! Named error kinds from spec.md §7.
//!
//! These are semantic categories, not a 1:1 map onto library error types —
//! call sites match on the variant to decide whether a loop retries,
//! whether a task row moves to `FAILED`, or whether the process exits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskFlowError {
    /// Network or temporary unavailability of the broker. The owning loop
    /// logs and retries on its next tick; nothing here is fatal.
    #[error("transient broker error: {0}")]
    TransientBroker(#[source] anyhow::Error),

    /// Same, for the relational store. The enclosing transaction is
    /// expected to have already rolled back by the time this is raised.
    #[error("transient store error: {0}")]
    TransientStore(#[source] anyhow::Error),

    /// A worker's `atomic_claim` returned nothing — not an error
    /// condition, just a race the caller should discard silently.
    #[error("task {task_id} was not in a claimable state")]
    ClaimRace { task_id: uuid::Uuid },

    /// No handler registered for the task's title.
    #[error("no handler registered for title {title:?}")]
    HandlerNotFound { title: String },

    /// A handler was resolved but the registry failed to deserialize the
    /// payload into the handler's expected type (or any other pre-execute
    /// resolution step failed).
    #[error("failed to load handler for {title:?}: {source}")]
    HandlerLoadFailure {
        title: String,
        #[source]
        source: anyhow::Error,
    },

    /// The handler itself returned an error.
    #[error("handler for {title:?} failed: {source}")]
    HandlerRuntimeError {
        title: String,
        #[source]
        source: anyhow::Error,
    },

    /// The handler did not finish within `TASK_TIMEOUT`.
    #[error("handler for {title:?} timed out after {timeout_secs}s")]
    HandlerTimeout { title: String, timeout_secs: u64 },

    /// A broker message failed JSON decode. The message is removed from
    /// both processing queues and logged; this is never retried.
    #[error("malformed broker message: {0}")]
    MalformedMessage(String),

    /// Missing required configuration at boot. The only variant allowed
    /// to propagate out of `main` to a non-zero exit.
    #[error("configuration error: {0}")]
    FatalConfig(#[source] anyhow::Error),
}

impl TaskFlowError {
    /// Whether a task that failed with this error still has retry budget
    /// left to attempt, independent of `retry_count` (a purely semantic
    /// classification: timeouts and runtime errors are always retryable
    /// from the error's own point of view — the store enforces the cap).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TaskFlowError::MalformedMessage(_) | TaskFlowError::FatalConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_message_is_not_retryable() {
        let err = TaskFlowError::MalformedMessage("bad json".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn handler_timeout_is_retryable() {
        let err = TaskFlowError::HandlerTimeout {
            title: "echo".into(),
            timeout_secs: 180,
        };
        assert!(err.is_retryable());
    }
}
