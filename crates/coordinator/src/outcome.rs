//! Aggregator → Trust Manager outcome queue.
//!
//! The Aggregator never calls back into the Trust Manager for credits and
//! debits; it publishes outcome events on this channel and a dedicated
//! consumer task applies them with bounded retries. A persistent failure is
//! logged and dropped; a verification that already happened is never
//! reverted by a failed trust update.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use threatnet_core::ReportOutcome;

use crate::trust::TrustManager;

/// Capacity of the outcome channel.
pub const OUTCOME_QUEUE_CAPACITY: usize = 4096;

/// Attempts before an outcome is dropped.
const MAX_ATTEMPTS: u32 = 3;

/// One report outcome to apply to a client's trust.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    /// The reporting client.
    pub client_id: String,
    /// What happened to the report.
    pub outcome: ReportOutcome,
    /// When the outcome was decided (unix seconds).
    pub at: i64,
}

/// Create the outcome channel.
pub fn channel() -> (mpsc::Sender<OutcomeEvent>, mpsc::Receiver<OutcomeEvent>) {
    mpsc::channel(OUTCOME_QUEUE_CAPACITY)
}

/// Apply one outcome event with bounded retries.
pub async fn apply(trust: &TrustManager, event: &OutcomeEvent) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match trust
            .update_on_report(&event.client_id, event.outcome, event.at)
            .await
        {
            Ok(_) => return,
            Err(e) if attempts < MAX_ATTEMPTS => {
                warn!(
                    client_id = %event.client_id,
                    attempts,
                    "trust outcome update failed, retrying: {:#}",
                    e
                );
            }
            Err(e) => {
                error!(
                    client_id = %event.client_id,
                    attempts,
                    "trust outcome update dropped: {:#}",
                    e
                );
                return;
            }
        }
    }
}

/// Spawn the consumer task that drains the channel into the Trust Manager.
pub fn spawn_consumer(
    trust: Arc<TrustManager>,
    mut rx: mpsc::Receiver<OutcomeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            apply(&trust, &event).await;
        }
    })
}
