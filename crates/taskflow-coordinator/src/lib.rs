//! Coordinator: leader election plus the four loops that keep the Task
//! Store and Broker converged — Scheduler, Recovery Scanner, Processing
//! Reclaimer, and Reconciler.
//!
//! Grounded on the teacher's `kernel/jobs/runner.rs`/`worker.rs` service
//! shape (one `tokio::spawn`ed task per concern, a shared shutdown
//! signal, `tokio::select!` between the tick and the shutdown signal) and
//! on the reference implementation's `core/queue_manager.py` for the
//! lease primitives and tuning constants. Only one coordinator replica
//! acts on the four work loops at a time; every replica runs the lease
//! maintainer so it can take over when the current leader's lease lapses.

mod leader;
mod reclaimer;
mod reconciler;
mod recovery;
mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use taskflow_broker::BrokerPair;
use taskflow_core::Config;
use taskflow_store::TaskStore;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub use leader::lease_loop;
pub use reclaimer::reclaimer_loop;
pub use reconciler::reconciler_loop;
pub use recovery::recovery_loop;
pub use scheduler::scheduler_loop;

/// Shared state every loop reads to decide whether to act this tick.
/// Per spec.md §4.4, "all loops sleep when not leader" — this is the one
/// piece of cross-task shared state in the whole coordinator; everything
/// else flows through the Store and Broker.
pub struct Coordinator {
    pub instance_id: String,
    pub store: Arc<dyn TaskStore>,
    pub brokers: Arc<BrokerPair>,
    pub config: Arc<Config>,
    pub is_leader: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn TaskStore>, brokers: Arc<BrokerPair>, config: Arc<Config>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            store,
            brokers,
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Runs one scheduler tick regardless of leader status. Exposed so
    /// integration tests can exercise a single tick's logic directly
    /// against real store/broker instances without waiting on the timer
    /// loop or faking leadership.
    pub async fn run_scheduler_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        scheduler::run_tick(self).await
    }

    /// Runs one recovery-scanner tick. See `run_scheduler_tick`.
    pub async fn run_recovery_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        recovery::run_tick(self).await
    }

    /// Sweeps both brokers' processing queues once. See
    /// `run_scheduler_tick`.
    pub async fn run_reclaimer_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        reclaimer::sweep(self, &self.brokers.high).await?;
        reclaimer::sweep(self, &self.brokers.low).await?;
        Ok(())
    }

    /// Runs one reconciler tick. See `run_scheduler_tick`.
    pub async fn run_reconciler_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        reconciler::run_tick(self).await
    }

    /// Spawns the lease maintainer and the four work loops, then waits
    /// for all of them to observe `shutdown` and exit. Each loop owns its
    /// own error boundary (spec.md §7) — a transient failure inside one
    /// tick never stops the loop or propagates here.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(instance_id = %self.instance_id, "coordinator starting");

        let handles = vec![
            tokio::spawn(leader::lease_loop(self.clone(), shutdown.clone())),
            tokio::spawn(scheduler::scheduler_loop(self.clone(), shutdown.clone())),
            tokio::spawn(recovery::recovery_loop(self.clone(), shutdown.clone())),
            tokio::spawn(reclaimer::reclaimer_loop(self.clone(), shutdown.clone())),
            tokio::spawn(reconciler::reconciler_loop(self.clone(), shutdown.clone())),
        ];

        for handle in handles {
            handle.await?;
        }

        info!(instance_id = %self.instance_id, "coordinator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_coordinator_starts_as_not_leader() {
        // Constructing a Coordinator needs real store/broker handles in
        // the full integration path; here we only check the flag default
        // via a bare AtomicBool, which is what `new` initializes with.
        let flag = AtomicBool::new(false);
        assert!(!flag.load(Ordering::SeqCst));
    }
}
