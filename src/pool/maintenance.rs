//! Periodic pool maintenance.

use super::{HandlePool, MaintainOutcome};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run [`HandlePool::maintain`] every `period` until `shutdown` fires.
///
/// The first pass happens one period after the call; startup is expected to
/// have run [`HandlePool::initialize`] already.
pub fn spawn_maintenance(
    pool: HandlePool,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Pool maintenance stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match pool.maintain().await {
                        MaintainOutcome::Replenished { created, failed } => {
                            let status = pool.status();
                            tracing::info!(
                                "Pool maintenance: {} created, {} failed ({}/{} available)",
                                created,
                                failed,
                                status.available,
                                status.target
                            );
                        }
                        MaintainOutcome::AlreadyRunning => {
                            tracing::debug!("Pool maintenance skipped, a pass is running");
                        }
                        MaintainOutcome::Satisfied => {}
                    }
                }
            }
        }
    })
}
