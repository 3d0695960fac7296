//! Handler Registry: maps a task `title` to an executable unit.
//!
//! Grounded on the teacher's `kernel/jobs/registry.rs` `JobRegistry` —
//! same `HashMap<&'static str, BoxedHandler>` shape, narrowed to the
//! contract in spec.md §4.6: resolving an unknown title is a handler
//! error (never a dropped task), synchronous and asynchronous handlers
//! present the same call shape, and a fresh resolution per invocation is
//! always acceptable (no stale-cache requirement, so there is nothing to
//! invalidate).

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use taskflow_core::TaskFlowError;

/// A handler's raw return value before post-processing into the task's
/// final `result` string.
pub type HandlerValue = serde_json::Value;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerValue>> + Send>>;

/// Boxed handler: takes the task's opaque payload string, returns a
/// future producing the handler's raw value. Payload parsing (if the
/// handler wants structured JSON) is the handler's own responsibility —
/// the registry never assumes a shape.
type BoxedHandler = Box<dyn Fn(String) -> HandlerFuture + Send + Sync>;

/// Maps task titles to handlers. Compile-time registration (spec.md
/// §4.6 option (a)) — handlers are registered once at process startup
/// and looked up by title on every claim.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register an asynchronous handler.
    pub fn register_async<F, Fut>(&mut self, title: &'static str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HandlerValue>> + Send + 'static,
    {
        self.handlers
            .insert(title, Box::new(move |payload| Box::pin(handler(payload))));
    }

    /// Register a synchronous (blocking) handler. It runs on the Tokio
    /// blocking thread pool via `spawn_blocking`, so from the caller's
    /// point of view it presents the identical `Future`-returning shape
    /// as an async handler — satisfying spec.md §4.6's "both must be
    /// supported uniformly" requirement.
    pub fn register_blocking<F>(&mut self, title: &'static str, handler: F)
    where
        F: Fn(String) -> Result<HandlerValue> + Send + Sync + Clone + 'static,
    {
        self.handlers.insert(
            title,
            Box::new(move |payload| {
                let handler = handler.clone();
                Box::pin(async move {
                    tokio::task::spawn_blocking(move || handler(payload))
                        .await
                        .map_err(|e| anyhow!("blocking handler panicked: {e}"))?
                })
            }),
        );
    }

    /// Resolve and invoke the handler for `title`. An unregistered title
    /// is an `Err` (the named `HandlerNotFound` kind from spec.md §7),
    /// never a panic — per spec.md §4.6 the worker maps this to
    /// `mark_for_retry`, the same as any other handler error.
    pub async fn execute(&self, title: &str, payload: String) -> Result<HandlerValue> {
        let handler = self.handlers.get(title).ok_or_else(|| {
            TaskFlowError::HandlerNotFound {
                title: title.to_string(),
            }
        })?;
        handler(payload).await
    }

    pub fn is_registered(&self, title: &str) -> bool {
        self.handlers.contains_key(title)
    }

    pub fn registered_titles(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

pub type SharedHandlerRegistry = Arc<HandlerRegistry>;

/// Registers the handlers a bare `taskflow-worker` binary ships with out
/// of the box: an `echo` handler that returns its payload verbatim, used
/// throughout spec.md §8's example scenarios. Real deployments build
/// their own registry (one `register_async`/`register_blocking` call per
/// handler title they own) instead of calling this; it exists so the
/// worker binary is runnable without first writing a deployment-specific
/// registry.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_async("echo", |payload| async move {
        match serde_json::from_str::<HandlerValue>(&payload) {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::Value::String(payload)),
        }
    });
    registry
}

/// Post-processes a handler's raw return value into the string stored as
/// the task's `result`, per spec.md §4.6's output contract: an object
/// with a `message` field uses that message; any other mapping or array
/// serializes to JSON; scalars take their plain string form.
pub fn format_handler_result(value: &HandlerValue) -> String {
    if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
        return message.to_string();
    }

    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_title_is_an_error_not_a_panic() {
        let registry = HandlerRegistry::new();
        let result = registry.execute("missing", "{}".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn async_handler_executes_and_returns_value() {
        let mut registry = HandlerRegistry::new();
        registry.register_async("echo", |payload| async move {
            Ok(json!({ "echoed": payload }))
        });

        let result = registry.execute("echo", "hi".to_string()).await.unwrap();
        assert_eq!(result["echoed"], "hi");
    }

    #[tokio::test]
    async fn blocking_handler_executes_uniformly() {
        let mut registry = HandlerRegistry::new();
        registry.register_blocking("sum", |payload| {
            let n: i64 = payload.parse().unwrap_or(0);
            Ok(json!({ "sum": n + 1 }))
        });

        let result = registry.execute("sum", "41".to_string()).await.unwrap();
        assert_eq!(result["sum"], 42);
    }

    #[test]
    fn format_handler_result_prefers_message_field() {
        let value = json!({ "message": "done", "other": 1 });
        assert_eq!(format_handler_result(&value), "done");
    }

    #[test]
    fn format_handler_result_serializes_mappings_without_message() {
        let value = json!({ "v": 1 });
        assert_eq!(format_handler_result(&value), "{\"v\":1}");
    }

    #[test]
    fn format_handler_result_uses_plain_string_for_scalars() {
        let value = json!("already a string");
        assert_eq!(format_handler_result(&value), "already a string");
    }

    #[test]
    fn registered_titles_reports_all_registrations() {
        let mut registry = HandlerRegistry::new();
        registry.register_async("a", |_p| async { Ok(json!(null)) });
        registry.register_async("b", |_p| async { Ok(json!(null)) });
        assert!(registry.is_registered("a"));
        assert!(registry.is_registered("b"));
        assert_eq!(registry.registered_titles().len(), 2);
    }

    #[tokio::test]
    async fn default_registry_echoes_json_payload() {
        let registry = default_registry();
        let result = registry.execute("echo", "{\"v\":1}".to_string()).await.unwrap();
        assert_eq!(result, json!({ "v": 1 }));
    }

    #[tokio::test]
    async fn default_registry_echoes_non_json_payload_as_string() {
        let registry = default_registry();
        let result = registry.execute("echo", "plain text".to_string()).await.unwrap();
        assert_eq!(result, json!("plain text"));
    }
}
