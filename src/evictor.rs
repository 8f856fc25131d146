//! Periodic removal of idle sessions

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::{error::BridgeResult, registry::SessionRegistry};

/// Sweep `registry` every `period`, evicting sessions idle longer than `idle_timeout`.
///
/// The first sweep happens one full period after start. Runs forever.
pub async fn run_evictor(
    registry: Arc<SessionRegistry>,
    period: Duration,
    idle_timeout: Duration,
) -> BridgeResult<()> {
    info!(
        "[EVICT] Sweeping every {:?}, idle timeout {:?}",
        period, idle_timeout
    );
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker
            .tick()
            .await;
        let evicted = registry
            .evict_idle(idle_timeout)
            .await;
        if evicted.is_empty() {
            debug!("[EVICT] Nothing to evict");
        } else {
            info!("[EVICT] Evicted {} idle session(s)", evicted.len());
        }
    }
}
