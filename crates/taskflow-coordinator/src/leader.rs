//! Leader election and lease renewal (spec.md §4.4).
//!
//! The lease lives on the `high` broker instance — spec.md never pins
//! `leader:key` to one of the two broker instances, but the reference
//! implementation's `core/queue_manager.py` keeps its coordination
//! primitives (lease, heartbeats) on the same Redis connection that also
//! serves auth/cache concerns, which spec.md §4.2 identifies as the
//! `high` instance. Recorded as a design decision in DESIGN.md.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use taskflow_broker::LEADER_KEY;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Coordinator;

pub async fn lease_loop(coord: Arc<Coordinator>, shutdown: CancellationToken) {
    let mut tick = interval(coord.config.renew_interval());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                release_lease_if_held(&coord).await;
                break;
            }
            _ = tick.tick() => {
                run_tick(&coord).await;
            }
        }
    }

    info!(instance_id = %coord.instance_id, "lease loop stopped");
}

async fn run_tick(coord: &Arc<Coordinator>) {
    if coord.is_leader() {
        renew(coord).await;
    } else {
        try_acquire(coord).await;
    }
}

async fn renew(coord: &Arc<Coordinator>) {
    let result = coord
        .brokers
        .high
        .compare_and_extend(LEADER_KEY, &coord.instance_id, coord.config.lease_ttl_ms)
        .await;

    match result {
        Ok(true) => {}
        Ok(false) => {
            warn!(instance_id = %coord.instance_id, "lost leader lease, relinquishing");
            coord.is_leader.store(false, Ordering::SeqCst);
        }
        Err(e) => {
            // TransientBrokerError: log and retry next tick; staying
            // "leader" locally until renewal either succeeds or the lease
            // genuinely expires and another instance takes over is safe —
            // Store-level atomic claims are idempotent across any
            // momentary multi-leader overlap (spec.md §5).
            error!(error = %e, "transient broker error renewing leader lease");
        }
    }
}

async fn try_acquire(coord: &Arc<Coordinator>) {
    let result = coord
        .brokers
        .high
        .set_if_absent_with_expiry(LEADER_KEY, &coord.instance_id, coord.config.lease_ttl_ms)
        .await;

    match result {
        Ok(true) => {
            info!(instance_id = %coord.instance_id, "acquired leader lease");
            coord.is_leader.store(true, Ordering::SeqCst);
        }
        Ok(false) => {}
        Err(e) => error!(error = %e, "transient broker error acquiring leader lease"),
    }
}

async fn release_lease_if_held(coord: &Arc<Coordinator>) {
    if !coord.is_leader() {
        return;
    }
    match coord
        .brokers
        .high
        .compare_and_delete(LEADER_KEY, &coord.instance_id)
        .await
    {
        Ok(true) => info!(instance_id = %coord.instance_id, "released leader lease on shutdown"),
        Ok(false) => warn!(
            instance_id = %coord.instance_id,
            "lease already held by someone else at shutdown, left untouched"
        ),
        Err(e) => error!(error = %e, "failed to release leader lease on shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use taskflow_broker::LEADER_KEY;

    #[test]
    fn leader_key_matches_spec_well_known_name() {
        assert_eq!(LEADER_KEY, "taskflow:leader");
    }
}
