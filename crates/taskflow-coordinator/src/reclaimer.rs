//! Processing-queue reclaimer (spec.md §4.4): sweeps `processing:default`
//! on each broker for abandoned or stale entries.
//!
//! Three outcomes per entry, matching spec.md verbatim:
//!   - undecodable message -> remove unconditionally, log (`MalformedMessage`)
//!   - task row no longer exists -> remove
//!   - task row is `IN_PROGRESS` -> leave alone, the worker still owns it
//!   - otherwise, once `now - updated_at > PROCESSING_RECLAIM_S`: remove
//!     the entry; if the row is still `PENDING`/`QUEUED` also re-push the
//!     message to the main queue and reset it to `QUEUED` (DESIGN.md Open
//!     Question d — a row already `COMPLETED`/`FAILED` is only swept, not
//!     resurrected, since terminal states never transition back out).

use std::sync::Arc;

use chrono::Utc;
use taskflow_broker::{Broker, RedisBroker, DEFAULT_PROCESSING_QUEUE, DEFAULT_QUEUE};
use taskflow_core::{Task, TaskMessage, TaskStatus};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Coordinator;

pub async fn reclaimer_loop(coord: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = interval(coord.config.reclaim_interval());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if !coord.is_leader() {
                    continue;
                }
                if let Err(e) = sweep(&coord, &coord.brokers.high).await {
                    error!(error = %e, broker = "high", "reclaimer sweep failed");
                }
                if let Err(e) = sweep(&coord, &coord.brokers.low).await {
                    error!(error = %e, broker = "low", "reclaimer sweep failed");
                }
            }
        }
    }

    info!(instance_id = %coord.instance_id, "reclaimer loop stopped");
}

pub(crate) async fn sweep(coord: &Arc<Coordinator>, broker: &RedisBroker) -> anyhow::Result<()> {
    let entries = broker.range(DEFAULT_PROCESSING_QUEUE, 0, -1).await?;
    let now = Utc::now();

    for raw in entries {
        let message: TaskMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "malformed processing-queue entry, dropping");
                broker.remove_one(DEFAULT_PROCESSING_QUEUE, &raw).await?;
                continue;
            }
        };

        let task = coord.store.get_task(message.task_id).await?;
        match decide(task.as_ref(), now, coord.config.processing_reclaim_s) {
            Decision::Leave => {}
            Decision::Drop => {
                broker.remove_one(DEFAULT_PROCESSING_QUEUE, &raw).await?;
            }
            Decision::Requeue => {
                broker.remove_one(DEFAULT_PROCESSING_QUEUE, &raw).await?;
                if coord
                    .store
                    .requeue_stale_processing_task(message.task_id, now)
                    .await?
                {
                    broker.enqueue(DEFAULT_QUEUE, &raw).await?;
                    warn!(task_id = %message.task_id, "reclaimed stale processing entry, requeued");
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Leave,
    Drop,
    Requeue,
}

fn decide(task: Option<&Task>, now: chrono::DateTime<Utc>, processing_reclaim_s: i64) -> Decision {
    let Some(task) = task else {
        return Decision::Drop;
    };

    if task.status == TaskStatus::InProgress {
        return Decision::Leave;
    }

    let age = (now - task.updated_at).num_seconds();
    if age > processing_reclaim_s {
        if task.status.is_terminal() {
            Decision::Drop
        } else {
            Decision::Requeue
        }
    } else {
        Decision::Leave
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use taskflow_core::TaskPriority;
    use uuid::Uuid;

    fn task_with(status: TaskStatus, age_seconds: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: "echo".into(),
            payload: "{}".into(),
            priority: TaskPriority::Low,
            status,
            scheduled_at: None,
            created_at: Utc::now() - ChronoDuration::seconds(age_seconds),
            updated_at: Utc::now() - ChronoDuration::seconds(age_seconds),
            worker_id: None,
            retry_count: 0,
            result: None,
        }
    }

    #[test]
    fn missing_task_is_dropped() {
        assert_eq!(decide(None, Utc::now(), 30), Decision::Drop);
    }

    #[test]
    fn in_progress_task_is_left_alone_regardless_of_age() {
        let task = task_with(TaskStatus::InProgress, 10_000);
        assert_eq!(decide(Some(&task), Utc::now(), 30), Decision::Leave);
    }

    #[test]
    fn fresh_non_in_progress_task_is_left_alone() {
        let task = task_with(TaskStatus::Queued, 5);
        assert_eq!(decide(Some(&task), Utc::now(), 30), Decision::Leave);
    }

    #[test]
    fn stale_queued_task_is_requeued() {
        let task = task_with(TaskStatus::Queued, 60);
        assert_eq!(decide(Some(&task), Utc::now(), 30), Decision::Requeue);
    }

    #[test]
    fn stale_terminal_task_is_only_dropped_never_resurrected() {
        let completed = task_with(TaskStatus::Completed, 60);
        assert_eq!(decide(Some(&completed), Utc::now(), 30), Decision::Drop);

        let failed = task_with(TaskStatus::Failed, 60);
        assert_eq!(decide(Some(&failed), Utc::now(), 30), Decision::Drop);
    }
}
