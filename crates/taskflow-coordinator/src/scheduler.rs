//! Scheduler loop (spec.md §4.4): moves due `PENDING` rows into the
//! broker and transitions them to `QUEUED`, one transaction per tick.

use std::sync::Arc;

use chrono::Utc;
use taskflow_broker::Broker;
use taskflow_core::{Task, TaskMessage, TaskPriority, TaskStatus};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::Coordinator;

const BATCH_LIMIT: i64 = 100;

pub async fn scheduler_loop(coord: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = interval(coord.config.scheduler_interval());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if !coord.is_leader() {
                    continue;
                }
                if let Err(e) = run_tick(&coord).await {
                    error!(error = %e, "scheduler tick failed");
                }
            }
        }
    }

    info!(instance_id = %coord.instance_id, "scheduler loop stopped");
}

pub(crate) async fn run_tick(coord: &Arc<Coordinator>) -> anyhow::Result<()> {
    let now = Utc::now();
    let (mut tx, rows) = coord.store.claim_due_batch(now, BATCH_LIMIT).await?;

    if rows.is_empty() {
        tx.commit().await?;
        return Ok(());
    }

    let (high_rows, low_rows): (Vec<&Task>, Vec<&Task>) = rows
        .iter()
        .partition(|row| row.priority == TaskPriority::High);

    let mut enqueued_ids = Vec::new();

    for (broker, batch, queue_name) in [
        (&coord.brokers.high, high_rows, "high"),
        (&coord.brokers.low, low_rows, "low"),
    ] {
        if batch.is_empty() {
            continue;
        }
        let messages: Vec<String> = batch
            .iter()
            .map(|row| encode_message(row))
            .collect::<Result<_, _>>()?;

        match broker.enqueue_many(taskflow_broker::DEFAULT_QUEUE, &messages).await {
            Ok(()) => {
                enqueued_ids.extend(batch.iter().map(|row| row.id));
            }
            Err(e) => {
                // TransientBrokerError: these rows stay PENDING (their
                // lock is released unmodified when the transaction
                // commits below) and will be retried next tick.
                error!(error = %e, queue = queue_name, "failed to enqueue batch, leaving rows pending");
            }
        }
    }

    if enqueued_ids.is_empty() {
        tx.commit().await?;
        return Ok(());
    }

    coord
        .store
        .batch_update_status(&mut tx, &enqueued_ids, TaskStatus::Queued, now)
        .await?;
    tx.commit().await?;

    debug!(count = enqueued_ids.len(), "scheduler queued tasks");
    Ok(())
}

fn encode_message(row: &Task) -> anyhow::Result<String> {
    let message = TaskMessage {
        task_id: row.id,
        title: row.title.clone(),
        payload: row.payload.clone(),
    };
    Ok(serde_json::to_string(&message)?)
}

/// Builds the wire message for a single due task. Exposed for the
/// reconciler, which re-enqueues already-`QUEUED` rows the same way.
pub fn task_message_for(task_id: Uuid, title: &str, payload: &str) -> anyhow::Result<String> {
    let message = TaskMessage {
        task_id,
        title: title.to_string(),
        payload: payload.to_string(),
    };
    Ok(serde_json::to_string(&message)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskflow_core::TaskStatus;

    fn sample_task(priority: TaskPriority) -> Task {
        Task {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: "echo".to_string(),
            payload: "{\"v\":1}".to_string(),
            priority,
            status: TaskStatus::Pending,
            scheduled_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            worker_id: None,
            retry_count: 0,
            result: None,
        }
    }

    #[test]
    fn encode_message_round_trips_through_json() {
        let task = sample_task(TaskPriority::High);
        let encoded = encode_message(&task).unwrap();
        let decoded: TaskMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task_id, task.id);
        assert_eq!(decoded.title, "echo");
        assert_eq!(decoded.payload, "{\"v\":1}");
    }

    #[test]
    fn task_message_for_matches_encode_message() {
        let task = sample_task(TaskPriority::Low);
        let via_task = encode_message(&task).unwrap();
        let via_fields = task_message_for(task.id, &task.title, &task.payload).unwrap();
        assert_eq!(via_task, via_fields);
    }
}
