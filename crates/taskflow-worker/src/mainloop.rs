//! Main poll loop (spec.md §4.5 steps 2-9): claim, execute, finalize.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskflow_broker::{Broker, RedisBroker, DEFAULT_PROCESSING_QUEUE, DEFAULT_QUEUE};
use taskflow_core::{retry_backoff_seconds, TaskFlowError, TaskMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Worker;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(2);

pub async fn poll_loop(worker: Arc<Worker>, shutdown: CancellationToken) {
    info!(worker_id = %worker.worker_id, "worker poll loop starting");

    while !shutdown.is_cancelled() {
        match poll_once(&worker).await {
            Ok(()) => {}
            Err(e) => {
                // An unexpected loop-level error (e.g. a dropped broker
                // connection), distinct from a per-task handler error.
                // Sleep briefly to avoid a CPU-spin and try again, per
                // the original worker's outer `try/except` around its
                // whole per-message handling span.
                error!(error = %e, worker_id = %worker.worker_id, "worker loop error, backing off");
                tokio::time::sleep(LOOP_ERROR_BACKOFF).await;
            }
        }
    }

    info!(worker_id = %worker.worker_id, "worker poll loop stopped");
}

/// One pass: try the high broker first, then low, bounded to
/// `POLL_TIMEOUT` each. High-over-low per poll cycle, not globally
/// starvation-free (spec.md §5).
pub(crate) async fn poll_once(worker: &Arc<Worker>) -> anyhow::Result<()> {
    if let Some(raw) = worker
        .brokers
        .high
        .blocking_pop_and_move(DEFAULT_QUEUE, DEFAULT_PROCESSING_QUEUE, POLL_TIMEOUT)
        .await?
    {
        handle_message(worker, raw).await?;
        return Ok(());
    }

    if let Some(raw) = worker
        .brokers
        .low
        .blocking_pop_and_move(DEFAULT_QUEUE, DEFAULT_PROCESSING_QUEUE, POLL_TIMEOUT)
        .await?
    {
        handle_message(worker, raw).await?;
    }

    Ok(())
}

async fn handle_message(worker: &Arc<Worker>, raw: String) -> anyhow::Result<()> {
    let message: TaskMessage = match serde_json::from_str(&raw) {
        Ok(m) => m,
        Err(e) => {
            let err = TaskFlowError::MalformedMessage(e.to_string());
            warn!(error = %err, "discarding malformed broker message");
            remove_from_both_processing_queues(worker, &raw).await;
            return Ok(());
        }
    };

    let now = Utc::now();
    let claimed = worker
        .store
        .atomic_claim(message.task_id, &worker.worker_id, now)
        .await?;

    let Some((payload, title)) = claimed else {
        debug!(task_id = %message.task_id, "claim race lost, discarding message");
        remove_from_both_processing_queues(worker, &raw).await;
        return Ok(());
    };

    debug!(task_id = %message.task_id, title = %title, worker_id = %worker.worker_id, "claimed task");

    let outcome = tokio::time::timeout(
        worker.config.task_timeout(),
        worker.registry.execute(&title, payload),
    )
    .await;

    match outcome {
        Ok(Ok(value)) => {
            let result = taskflow_registry::format_handler_result(&value);
            if let Err(e) = worker
                .store
                .mark_completed(message.task_id, &result, Utc::now())
                .await
            {
                error!(error = %e, task_id = %message.task_id, "failed to mark task completed");
            } else {
                info!(task_id = %message.task_id, worker_id = %worker.worker_id, "task completed");
            }
        }
        Ok(Err(e)) => {
            // mark_for_retry/the RETRIED event record "the exception's
            // message" verbatim (spec.md §7, §8 scenario 4) — the raw
            // source message, not the `TaskFlowError` variant's decorated
            // Display text, which is logged separately here.
            let handler_message = e.to_string();
            let err = TaskFlowError::HandlerRuntimeError {
                title: title.clone(),
                source: e,
            };
            warn!(task_id = %message.task_id, error = %err, "handler failed");
            retry_or_fail(worker, message.task_id, &handler_message).await;
        }
        Err(_) => {
            let timeout_secs = worker.config.task_timeout_s;
            let handler_message = format!("handler timed out after {timeout_secs}s");
            let err = TaskFlowError::HandlerTimeout {
                title: title.clone(),
                timeout_secs,
            };
            warn!(task_id = %message.task_id, error = %err, "handler timed out");
            retry_or_fail(worker, message.task_id, &handler_message).await;
        }
    }

    remove_from_both_processing_queues(worker, &raw).await;
    Ok(())
}

/// Looks up the task's current `retry_count` to compute this attempt's
/// backoff (`min(60, 5 * new_retry_count)`, spec.md §4.5 step 8), then
/// calls `mark_for_retry`.
async fn retry_or_fail(worker: &Arc<Worker>, task_id: uuid::Uuid, error_message: &str) {
    let now = Utc::now();
    let current_retry_count = match worker.store.get_task(task_id).await {
        Ok(Some(task)) => task.retry_count,
        Ok(None) => {
            warn!(task_id = %task_id, "task vanished before retry accounting, skipping");
            return;
        }
        Err(e) => {
            error!(error = %e, task_id = %task_id, "failed to read task for retry accounting");
            return;
        }
    };

    let backoff_seconds = retry_backoff_seconds(current_retry_count + 1);
    let result = worker
        .store
        .mark_for_retry(
            task_id,
            error_message,
            now,
            backoff_seconds,
            worker.config.max_retries,
        )
        .await;

    match result {
        Ok(Some(remaining)) => {
            warn!(task_id = %task_id, remaining, error = error_message, "task failed, retry scheduled");
        }
        Ok(None) => {
            warn!(task_id = %task_id, error = error_message, "task failed, retries exhausted");
        }
        Err(e) => {
            error!(error = %e, task_id = %task_id, "failed to schedule task retry");
        }
    }
}

/// Removes the message from both processing queues. It is only ever on
/// one of them, but `remove_one` is a no-op when absent, so clearing both
/// is robust to routing drift (spec.md §4.5 step 9).
async fn remove_from_both_processing_queues(worker: &Arc<Worker>, raw: &str) {
    for broker in [&worker.brokers.high, &worker.brokers.low] as [&RedisBroker; 2] {
        if let Err(e) = broker.remove_one(DEFAULT_PROCESSING_QUEUE, raw).await {
            error!(error = %e, "failed to clear processing-queue entry");
        }
    }
}
