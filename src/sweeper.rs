// =============================================================================
// BACKGROUND SWEEPER
// =============================================================================
// Periodic housekeeping that no request triggers on its own:
// - pending reservations past their TTL are cancelled (reason "expired")
// - auto-renewing subscriptions past their end date are renewed
// - outbox events left undelivered are re-broadcast
//
// A failed pass is logged and retried on the next tick.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::AvailabilityCache;
use crate::engine::ReservationEngine;
use crate::metrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub expired: usize,
    pub renewed: usize,
    pub relayed: usize,
    pub failed: usize,
}

pub async fn run_once(engine: &ReservationEngine, cache: Option<&AvailabilityCache>) -> SweepSummary {
    let mut summary = SweepSummary::default();

    match engine.expire_pending().await {
        Ok(expired) => {
            summary.expired = expired.len();
            if let Some(cache) = cache {
                let lots: HashSet<_> = expired.iter().map(|r| r.lot_id).collect();
                for lot_id in lots {
                    cache.invalidate(lot_id).await;
                }
            }
        }
        Err(e) => {
            summary.failed += 1;
            tracing::warn!(error = %e, "Pending expiry sweep failed");
        }
    }

    match engine.renew_due_subscriptions().await {
        Ok(renewed) => summary.renewed = renewed,
        Err(e) => {
            summary.failed += 1;
            tracing::warn!(error = %e, "Subscription renewal sweep failed");
        }
    }

    match engine.relay_outbox().await {
        Ok(relayed) => summary.relayed = relayed,
        Err(e) => {
            summary.failed += 1;
            tracing::warn!(error = %e, "Outbox relay failed");
        }
    }

    metrics::record_sweeper_action("expired", summary.expired as u64);
    metrics::record_sweeper_action("renewed", summary.renewed as u64);
    metrics::record_sweeper_action("relayed", summary.relayed as u64);
    metrics::record_sweeper_action("failed", summary.failed as u64);

    if summary != SweepSummary::default() {
        tracing::info!(
            expired = summary.expired,
            renewed = summary.renewed,
            relayed = summary.relayed,
            failed = summary.failed,
            "Sweep completed"
        );
    }
    summary
}

pub fn spawn_sweeper(
    engine: Arc<ReservationEngine>,
    cache: Option<AvailabilityCache>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_once(&engine, cache.as_ref()).await;
        }
    })
}
