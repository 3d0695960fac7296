//! Worker: claims a message from the broker, runs it through the claim
//! protocol against the store, executes the handler under timeout, and
//! finalizes.
//!
//! Grounded on the teacher's `kernel/jobs/worker.rs` shape (heartbeat and
//! poll run as independent tasks under one `CancellationToken`) and the
//! reference implementation's `worker/main.py` / `worker/heartbeat.py` /
//! `worker/task_handler.py` for the claim/execute/finalize protocol
//! itself, which spec.md §4.5 describes step by step.

mod heartbeat;
mod mainloop;

use std::sync::Arc;

use taskflow_broker::BrokerPair;
use taskflow_core::Config;
use taskflow_registry::SharedHandlerRegistry;
use taskflow_store::TaskStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use heartbeat::heartbeat_loop;
pub use mainloop::poll_loop;

/// A single worker process's identity and its shared collaborators. One
/// `Worker` runs exactly one heartbeat task and one poll loop.
pub struct Worker {
    pub worker_id: String,
    pub store: Arc<dyn TaskStore>,
    pub brokers: Arc<BrokerPair>,
    pub registry: SharedHandlerRegistry,
    pub config: Arc<Config>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        brokers: Arc<BrokerPair>,
        registry: SharedHandlerRegistry,
        config: Arc<Config>,
    ) -> Self {
        Self {
            worker_id: short_worker_id(),
            store,
            brokers,
            registry,
            config,
        }
    }

    /// Spawns the heartbeat task and the main poll loop, then waits for
    /// both to observe `shutdown` and exit. The poll loop finishes its
    /// current task (if any) before returning; the heartbeat stops as
    /// soon as the signal lands, per spec.md §4.5 step 10.
    /// Runs a single claim/execute/finalize pass (spec.md §4.5 steps
    /// 2-9) without the surrounding poll loop. Exposed so integration
    /// tests can drive one message through the full protocol against
    /// real store/broker instances.
    pub async fn poll_once(self: &Arc<Self>) -> anyhow::Result<()> {
        mainloop::poll_once(self).await
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(worker_id = %self.worker_id, "worker starting");

        // The heartbeat has its own stop signal, cancelled only once the
        // poll loop has actually returned — spec.md §4.5 step 10 orders
        // this "finish the current task, *then* stop the heartbeat", not
        // both simultaneously on the same signal.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat::heartbeat_loop(self.clone(), heartbeat_stop.clone()));
        let poll = tokio::spawn(mainloop::poll_loop(self.clone(), shutdown));

        poll.await?;
        heartbeat_stop.cancel();
        heartbeat.await?;

        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }
}

/// A short random identifier, per spec.md §4.5: "Each worker has a short
/// random `worker_id`." Eight hex characters of a fresh UUIDv4 — unique
/// enough across a realistic fleet size, short enough to read in logs.
fn short_worker_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_worker_id_is_eight_hex_chars() {
        let id = short_worker_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_worker_id_varies_between_calls() {
        assert_ne!(short_worker_id(), short_worker_id());
    }
}
