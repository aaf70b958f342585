use crate::config::MonitorConfig;
use crate::model::RoverId;
use crate::registry::RoverRegistry;
use chrono::Duration;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically demotes idle rovers to OFFLINE until `cancel` fires
pub async fn run_monitor(registry: Arc<RoverRegistry>, config: MonitorConfig, cancel: CancellationToken) {
    info!(
        "Starting liveness monitor with period={:?}, offline_threshold={:?}",
        config.period, config.offline_threshold
    );

    let threshold = match Duration::from_std(config.offline_threshold) {
        Ok(threshold) => threshold,
        Err(e) => {
            warn!("Offline threshold out of range, monitor disabled: {}", e);
            return;
        }
    };

    let mut ticker = interval(config.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let demoted = sweep(&registry, threshold).await;
                if !demoted.is_empty() {
                    info!("Marked {} rovers OFFLINE: {:?}", demoted.len(), demoted);
                }
            }
        }
    }

    info!("Liveness monitor stopped");
}

/// One monitor tick. Returns the rovers demoted to OFFLINE.
pub async fn sweep(registry: &RoverRegistry, threshold: Duration) -> Vec<RoverId> {
    let now = registry.clock().now();
    let mut demoted = Vec::new();

    for rover in registry.list_by_customer(None).await {
        if !rover.status.is_live() || now - rover.liveness_reference() <= threshold {
            continue;
        }

        match registry.mark_offline(rover.id, now, threshold).await {
            Ok(true) => demoted.push(rover.id),
            Ok(false) => debug!("Rover {} became active during sweep", rover.id),
            Err(e) => warn!("Failed to mark rover {} offline: {}", rover.id, e),
        }
    }

    demoted
}
