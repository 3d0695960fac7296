//! Heartbeat service (spec.md §4.5 step 1): a periodic liveness marker
//! the Recovery scanner checks for. Starts immediately at worker boot
//! and refreshes on every tick until told to stop.
//!
//! Written only to the `high` broker instance, matching the coordinator's
//! choice of broker for the leader lease (see `taskflow-coordinator`'s
//! `leader.rs`) — a worker has exactly one heartbeat key regardless of
//! which broker instance its current task happens to route through.

use std::sync::Arc;

use taskflow_broker::{heartbeat_key, Broker};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Worker;

const HEARTBEAT_VALUE: &str = "alive";

pub async fn heartbeat_loop(worker: Arc<Worker>, stop: CancellationToken) {
    info!(worker_id = %worker.worker_id, "heartbeat service starting");
    let mut tick = interval(worker.config.heartbeat_interval());
    let key = heartbeat_key(&worker.worker_id);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                let result = worker
                    .brokers
                    .high
                    .set_with_expiry(&key, HEARTBEAT_VALUE, worker.config.heartbeat_ttl_s)
                    .await;
                if let Err(e) = result {
                    error!(error = %e, worker_id = %worker.worker_id, "failed to refresh heartbeat");
                }
            }
        }
    }

    info!(worker_id = %worker.worker_id, "heartbeat service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_key_is_stable_for_a_given_worker() {
        assert_eq!(heartbeat_key("abcd1234"), "worker:abcd1234:heartbeat");
    }
}
