use std::{collections::BTreeSet, sync::Arc};

use log::{error, info};
use tokio::{task::JoinHandle, time};

use crate::types::{MutationId, now_ms};

use super::{context::SyncContext, events::FailureReason};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stuck mutations failed by this sweep.
    pub reaped: Vec<MutationId>,
    /// Expired failed mutations deleted.
    pub purged: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.reaped.extend(other.reaped);
        self.purged += other.purged;
    }
}

/// Fails mutations stuck in flight and purges expired failures.
#[derive(Clone)]
pub struct StuckJobReaper {
    ctx: Arc<SyncContext>,
}

impl StuckJobReaper {
    /// Reaper over the shared context.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Fails mutations of `collection` in flight for `stale_after_ms` or longer.
    ///
    /// Each goes through the terminal-failure path once, even if its send
    /// completes afterwards.
    pub fn sweep(&self, collection: &str, stale_after_ms: u64) -> SweepReport {
        let now = now_ms();
        let stale = self
            .ctx
            .queue()
            .stale_in_flight(collection, now.saturating_sub(stale_after_ms));

        let mut report = SweepReport::default();
        for (id, since) in stale {
            let reason = FailureReason::StuckJob {
                in_flight_ms: now.saturating_sub(since),
            };
            if self.ctx.fail_terminally(&id, reason).is_some() {
                report.reaped.push(id);
            }
        }

        let cutoff = now.saturating_sub(self.ctx.config().failed_retention_ms);
        let purged = self.ctx.queue().purge_failed_before(collection, cutoff);
        match purged {
            Ok(purged) => report.purged = purged.len(),
            Err(err) => error!("could not purge failed mutations of {collection}: {err}"),
        }

        if !report.reaped.is_empty() || report.purged > 0 {
            info!(
                "swept {collection}: {} stuck, {} expired",
                report.reaped.len(),
                report.purged
            );
        }
        report
    }

    /// Sweeps every collection with in-flight or failed mutations.
    pub fn sweep_all(&self) -> SweepReport {
        let collections: BTreeSet<String> = {
            let queue = self.ctx.queue();
            queue
                .collections_in_flight()
                .into_iter()
                .chain(queue.list_failed(None).into_iter().map(|r| r.collection))
                .collect()
        };

        let stale_after = self.ctx.config().stale_after_ms;
        let mut report = SweepReport::default();
        for collection in collections {
            report.merge(self.sweep(&collection, stale_after));
        }
        report
    }

    /// Sweeps every `reap_interval` until aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        let period = self.ctx.config().reap_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_all();
            }
        })
    }
}
