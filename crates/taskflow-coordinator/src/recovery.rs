//! Recovery (worker death) scanner (spec.md §4.4): detects `IN_PROGRESS`
//! rows whose owning worker has stopped heartbeating and re-queues or
//! fails them out.
//!
//! Heartbeat keys live on the `high` broker, matching the leader lease
//! (see `leader.rs`'s doc comment) — a worker only ever writes one
//! heartbeat key regardless of which broker instance its current task
//! happened to route through.

use std::sync::Arc;

use chrono::Utc;
use taskflow_broker::{heartbeat_key, Broker};
use taskflow_store::RecoveryOutcome;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Coordinator;

pub async fn recovery_loop(coord: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = interval(coord.config.reclaim_interval());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if !coord.is_leader() {
                    continue;
                }
                if let Err(e) = run_tick(&coord).await {
                    error!(error = %e, "recovery scanner tick failed");
                }
            }
        }
    }

    info!(instance_id = %coord.instance_id, "recovery scanner stopped");
}

pub(crate) async fn run_tick(coord: &Arc<Coordinator>) -> anyhow::Result<()> {
    let in_progress = coord.store.list_in_progress().await?;
    let now = Utc::now();

    for task in in_progress {
        let dead = match &task.worker_id {
            None => true,
            Some(worker_id) => !coord.brokers.high.exists(&heartbeat_key(worker_id)).await?,
        };

        if !dead {
            continue;
        }

        let outcome = coord
            .store
            .recover_dead_worker_task(task.id, now, coord.config.max_retries)
            .await?;

        match outcome {
            RecoveryOutcome::Requeued => {
                let message = crate::scheduler::task_message_for(task.id, &task.title, &task.payload)?;
                let queue = match task.priority {
                    taskflow_core::TaskPriority::High => &coord.brokers.high,
                    taskflow_core::TaskPriority::Low => &coord.brokers.low,
                };
                queue.enqueue(taskflow_broker::DEFAULT_QUEUE, &message).await?;
                warn!(task_id = %task.id, "requeued task from dead worker");
            }
            RecoveryOutcome::Failed => {
                warn!(task_id = %task.id, "dead worker's task exhausted retries, marked failed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use taskflow_broker::heartbeat_key;

    #[test]
    fn heartbeat_key_is_namespaced_by_worker_id() {
        assert_eq!(heartbeat_key("w-1"), "worker:w-1:heartbeat");
        assert_ne!(heartbeat_key("w-1"), heartbeat_key("w-2"));
    }
}
