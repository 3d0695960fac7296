//! Shared domain types, configuration, and error taxonomy for TaskFlow.
//!
//! This crate has no dependency on the store or broker implementations —
//! it is the vocabulary every other crate in the workspace speaks.

mod config;
mod error;
mod task;

pub use config::Config;
pub use error::TaskFlowError;
pub use task::{
    truncate_event_message, Task, TaskEvent, TaskEventType, TaskMessage, TaskPriority, TaskStatus,
    EVENT_MESSAGE_MAX_LEN,
};

/// Backoff applied to handler-failure retries: `min(60, 5 * retry_count)`
/// seconds, per spec.md §4.5 step 8.
pub fn retry_backoff_seconds(retry_count: i32) -> i64 {
    std::cmp::min(60, 5 * retry_count as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_linearly_then_caps() {
        assert_eq!(retry_backoff_seconds(1), 5);
        assert_eq!(retry_backoff_seconds(3), 15);
        assert_eq!(retry_backoff_seconds(20), 60);
        assert_eq!(retry_backoff_seconds(100), 60);
    }
}
