//! Reconciler loop (spec.md §4.4): repairs `QUEUED`-in-store-but-missing-
//! in-broker divergence by unconditionally re-enqueuing a bounded batch
//! of `QUEUED` rows every 30 seconds. Re-enqueuing an already-present
//! message is harmless — at most a duplicate list entry a worker's
//! `atomic_claim` will discard as a `ClaimRace` for every claimant after
//! the first.

use std::sync::Arc;
use std::time::Duration;

use taskflow_broker::{Broker, DEFAULT_QUEUE};
use taskflow_core::TaskPriority;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Coordinator;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const BATCH_LIMIT: i64 = 100;

pub async fn reconciler_loop(coord: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = interval(RECONCILE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if !coord.is_leader() {
                    continue;
                }
                if let Err(e) = run_tick(&coord).await {
                    error!(error = %e, "reconciler tick failed");
                }
            }
        }
    }

    info!(instance_id = %coord.instance_id, "reconciler loop stopped");
}

pub(crate) async fn run_tick(coord: &Arc<Coordinator>) -> anyhow::Result<()> {
    let queued = coord.store.list_queued(BATCH_LIMIT).await?;
    if queued.is_empty() {
        return Ok(());
    }

    for task in &queued {
        let message = crate::scheduler::task_message_for(task.id, &task.title, &task.payload)?;
        let broker = match task.priority {
            TaskPriority::High => &coord.brokers.high,
            TaskPriority::Low => &coord.brokers.low,
        };
        broker.enqueue(DEFAULT_QUEUE, &message).await?;
    }

    debug!(count = queued.len(), "reconciler re-enqueued queued tasks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::RECONCILE_INTERVAL;
    use std::time::Duration;

    #[test]
    fn reconcile_interval_matches_spec() {
        assert_eq!(RECONCILE_INTERVAL, Duration::from_secs(30));
    }
}
