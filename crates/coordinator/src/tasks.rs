//! Periodic maintenance tasks.
//!
//! Three interval loops interleave with live traffic through the same row
//! locks the request path uses: trust decay, the IOC expire sweep, and the
//! heartbeat reaper. Each loop logs and continues on error; it will retry on
//! the next tick.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fabric::OutboundEvent;
use crate::now_ts;
use crate::server::AppState;

/// Fixed poll cadence of the heartbeat reaper.
///
/// Independent from `heartbeat_interval_secs`, which only sets the
/// three-missed-intervals offline threshold.
const REAPER_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the decay, expire-sweep, and heartbeat-reaper loops.
pub fn spawn_periodic_tasks(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        spawn_decay_loop(state.clone()),
        spawn_expire_loop(state.clone()),
        spawn_reaper_loop(state.clone()),
    ]
}

fn spawn_decay_loop(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.config.trust.decay_interval();
        info!("decay loop starting with interval {:?}", period);

        let mut interval = tokio::time::interval(period);
        interval.tick().await; // First tick completes immediately, skip it

        loop {
            interval.tick().await;
            match state.trust.apply_decay_tick(now_ts()).await {
                Ok(count) => debug!(count, "decay tick complete"),
                Err(e) => warn!("decay tick failed: {:#}", e),
            }
        }
    })
}

fn spawn_expire_loop(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(state.config.intel.expire_sweep_interval_secs);
        info!("expire sweep starting with interval {:?}", period);

        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;
            match state.aggregator.expire_sweep().await {
                Ok(0) => {}
                Ok(count) => info!(count, "expire sweep marked stale IOCs"),
                Err(e) => warn!("expire sweep failed: {:#}", e),
            }
        }
    })
}

/// Marks clients offline after three missed heartbeat intervals.
fn spawn_reaper_loop(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let heartbeat_secs = state.config.fabric.heartbeat_interval_secs;
        info!(
            "heartbeat reaper starting with interval {:?}",
            REAPER_POLL_INTERVAL
        );

        let mut interval = tokio::time::interval(REAPER_POLL_INTERVAL);
        interval.tick().await;

        loop {
            interval.tick().await;
            let now = now_ts();
            let deadline = 3 * heartbeat_secs as i64;

            for client_id in state.fabric.online_ids() {
                let last_heartbeat = match state.storage.get_trust(&client_id).await {
                    Ok(Some(score)) => score.last_heartbeat_at,
                    Ok(None) => None,
                    Err(e) => {
                        warn!(client_id, "reaper trust read failed: {:#}", e);
                        continue;
                    }
                };

                let Some(last_heartbeat) = last_heartbeat else {
                    continue;
                };

                if now - last_heartbeat > deadline {
                    info!(
                        client_id,
                        silent_for = now - last_heartbeat,
                        "reaping silent client"
                    );
                    if state.fabric.close_client(&client_id) {
                        let trust = state
                            .storage
                            .get_trust(&client_id)
                            .await
                            .ok()
                            .flatten()
                            .map(|score| score.value)
                            .unwrap_or_default();
                        state.fabric.broadcast(&OutboundEvent::ClientStatus {
                            client_id: client_id.clone(),
                            online: false,
                            trust,
                        });
                    }
                }
            }
        }
    })
}
