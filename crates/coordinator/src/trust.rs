//! Trust Manager: per-client reputation with multi-factor scoring and decay.
//!
//! The store is the single source of truth; every mutation is a
//! read-modify-write serialized per client by a lock stripe. Decay is lazy:
//! it is applied (and persisted) whenever a score is read, with closed-form
//! catch-up across missed intervals, and a periodic tick sweeps clients that
//! nobody is reading.

use anyhow::{Context, Result};
use tracing::{debug, info};

use threatnet_core::{ReportOutcome, TrustEvent, TrustEventReason, TrustScore};

use crate::config::TrustConfig;
use crate::locks::KeyedLocks;
use crate::now_ts;
use crate::storage::Storage;

/// Stateful reputation engine.
#[derive(Debug)]
pub struct TrustManager {
    storage: Storage,
    config: TrustConfig,
    locks: KeyedLocks,
}

impl TrustManager {
    /// Create a Trust Manager over the given store.
    pub fn new(storage: Storage, config: TrustConfig) -> Self {
        Self {
            storage,
            config,
            locks: KeyedLocks::default(),
        }
    }

    /// Current score for a client, creating the row at `initial_trust` for
    /// unknown clients and applying lazy decay before returning.
    pub async fn get(&self, client_id: &str) -> Result<TrustScore> {
        self.get_at(client_id, now_ts()).await
    }

    /// [`TrustManager::get`] with an explicit clock, for tests and sweeps.
    pub async fn get_at(&self, client_id: &str, now: i64) -> Result<TrustScore> {
        let _guard = self.locks.lock(client_id).await;
        let score = self.load_or_init(client_id, now).await?;
        self.apply_decay(score, now).await
    }

    /// Record a report outcome and recompute the client's score.
    pub async fn update_on_report(
        &self,
        client_id: &str,
        outcome: ReportOutcome,
        now: i64,
    ) -> Result<TrustScore> {
        let _guard = self.locks.lock(client_id).await;
        let score = self.load_or_init(client_id, now).await?;
        // Catch up on decay first so the blend starts from the current value.
        let mut score = self.apply_decay(score, now).await?;
        let old_value = score.value;

        let reason = match outcome {
            ReportOutcome::Submitted => {
                score.reports_total += 1;
                TrustEventReason::Report
            }
            ReportOutcome::Accepted => {
                score.reports_accepted += 1;
                TrustEventReason::Accepted
            }
            ReportOutcome::Rejected => {
                score.reports_rejected += 1;
                TrustEventReason::Rejected
            }
        };

        // A bare submission only advances the counters; the value moves when
        // a verification verdict arrives (or through decay).
        if outcome != ReportOutcome::Submitted {
            let raw = self.raw_score(&score, outcome, now).await?;
            let alpha = self.config.learning_rate;
            score.value = (alpha * raw + (1.0 - alpha) * score.value)
                .clamp(self.config.min_trust, self.config.max_trust);
        }
        score.last_updated_at = now;

        self.storage.save_trust(&score).await?;
        self.storage
            .append_trust_event(&TrustEvent {
                client_id: client_id.to_string(),
                at: now,
                delta: score.value - old_value,
                reason,
            })
            .await?;

        info!(
            client_id,
            reason = reason.as_str(),
            old = format_args!("{:.3}", old_value),
            new = format_args!("{:.3}", score.value),
            "trust updated"
        );

        Ok(score)
    }

    /// Record a heartbeat. Does not change the trust value directly; feeds
    /// the responsiveness factor of later score updates.
    pub async fn register_heartbeat(&self, client_id: &str, at: i64) -> Result<()> {
        let _guard = self.locks.lock(client_id).await;
        let mut score = self.load_or_init(client_id, at).await?;
        score.last_heartbeat_at = Some(at);
        self.storage.save_trust(&score).await
    }

    /// Decay every client whose score has gone stale. Returns how many rows
    /// were visited. Idempotent: catch-up is keyed off `last_updated_at`.
    pub async fn apply_decay_tick(&self, now: i64) -> Result<u64> {
        let cutoff = now - self.config.decay_interval_secs as i64;
        let stale = self.storage.stale_trust_clients(cutoff).await?;
        let count = stale.len() as u64;
        for client_id in stale {
            self.get_at(&client_id, now).await?;
        }
        if count > 0 {
            debug!(count, "decay tick applied");
        }
        Ok(count)
    }

    /// All trust rows, for dashboards and stats.
    pub async fn snapshot(&self) -> Result<Vec<TrustScore>> {
        self.storage.all_trust_scores().await
    }

    /// Recent trust events for a client, newest first.
    pub async fn history(&self, client_id: &str, limit: i64) -> Result<Vec<TrustEvent>> {
        self.storage.trust_history(client_id, limit).await
    }

    /// Manually reset a client's trust to the initial value.
    pub async fn reset(&self, client_id: &str, now: i64) -> Result<TrustScore> {
        let _guard = self.locks.lock(client_id).await;
        let mut score = self.load_or_init(client_id, now).await?;
        let delta = self.config.initial_trust - score.value;
        score.value = self.config.initial_trust;
        score.last_updated_at = now;
        self.storage.save_trust(&score).await?;
        self.storage
            .append_trust_event(&TrustEvent {
                client_id: client_id.to_string(),
                at: now,
                delta,
                reason: TrustEventReason::Manual,
            })
            .await?;
        info!(client_id, "trust reset to initial");
        Ok(score)
    }

    /// Mean trust across the given clients at `now`. Returns 0.0 for an
    /// empty set.
    pub async fn mean_trust(&self, client_ids: &[String], now: i64) -> Result<f64> {
        if client_ids.is_empty() {
            return Ok(0.0);
        }
        let mut sum = 0.0;
        for client_id in client_ids {
            sum += self.get_at(client_id, now).await?.value;
        }
        Ok(sum / client_ids.len() as f64)
    }

    async fn load_or_init(&self, client_id: &str, now: i64) -> Result<TrustScore> {
        if let Some(score) = self.storage.get_trust(client_id).await? {
            return Ok(score);
        }
        self.storage
            .init_trust(client_id, self.config.initial_trust, now)
            .await?;
        self.storage
            .get_trust(client_id)
            .await?
            .context("Trust row missing after initialization")
    }

    /// Apply closed-form decay catch-up and persist if the row was stale.
    async fn apply_decay(&self, mut score: TrustScore, now: i64) -> Result<TrustScore> {
        let interval = self.config.decay_interval_secs as i64;
        let elapsed = now - score.last_updated_at;
        if elapsed < interval {
            return Ok(score);
        }

        let periods = (elapsed / interval).min(i32::MAX as i64) as i32;
        let factor = self.config.decay_rate.powi(periods);
        let old_value = score.value;
        let initial = self.config.initial_trust;
        score.value =
            (initial + (score.value - initial) * factor).clamp(self.config.min_trust, self.config.max_trust);
        // Advance by whole periods so partial intervals keep accruing.
        score.last_updated_at += periods as i64 * interval;

        self.storage.save_trust(&score).await?;
        let delta = score.value - old_value;
        if delta.abs() > f64::EPSILON {
            self.storage
                .append_trust_event(&TrustEvent {
                    client_id: score.client_id.clone(),
                    at: now,
                    delta,
                    reason: TrustEventReason::Decay,
                })
                .await?;
            debug!(
                client_id = %score.client_id,
                periods,
                old = format_args!("{:.3}", old_value),
                new = format_args!("{:.3}", score.value),
                "trust decayed"
            );
        }

        Ok(score)
    }

    /// The weighted multi-factor raw score.
    async fn raw_score(&self, score: &TrustScore, outcome: ReportOutcome, now: i64) -> Result<f64> {
        let accuracy = score.reports_accepted as f64
            / (score.reports_accepted + score.reports_rejected).max(1) as f64;

        let contribution =
            (score.reports_total as f64 / self.config.contribution_norm as f64).min(1.0);

        let responsiveness = match score.last_heartbeat_at {
            Some(heartbeat) => {
                let age = (now - heartbeat).max(0) as f64;
                (-age / self.config.responsiveness_tau_secs as f64).exp()
            }
            None => 0.0,
        };

        let window = self.config.consistency_window as i64;
        let mut samples = match outcome {
            // The event for this outcome has not been appended yet; include it.
            ReportOutcome::Accepted => vec![1.0],
            ReportOutcome::Rejected => vec![0.0],
            ReportOutcome::Submitted => Vec::new(),
        };
        samples.extend(
            self.storage
                .recent_outcomes(&score.client_id, window)
                .await?,
        );
        samples.truncate(window as usize);
        let consistency = (1.0 - stddev(&samples)).clamp(0.0, 1.0);

        let w = &self.config.weights;
        Ok(w.accuracy * accuracy
            + w.contribution * contribution
            + w.responsiveness * responsiveness
            + w.consistency * consistency)
    }
}

/// Population standard deviation; 0.0 for fewer than two samples.
fn stddev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup() -> (TrustManager, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        (TrustManager::new(storage, TrustConfig::default()), temp_db)
    }

    #[test]
    fn test_stddev() {
        assert_eq!(stddev(&[]), 0.0);
        assert_eq!(stddev(&[1.0]), 0.0);
        assert_eq!(stddev(&[1.0, 1.0, 1.0]), 0.0);
        // Half ones, half zeros: stddev is 0.5.
        assert!((stddev(&[1.0, 0.0, 1.0, 0.0]) - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unknown_client_created_at_initial() {
        let (trust, _tmp) = setup().await;

        let score = trust.get_at("fresh-agent", 1_000).await.unwrap();
        assert_eq!(score.value, 0.5);
        assert_eq!(score.reports_total, 0);
        assert_eq!(score.created_at, 1_000);
    }

    #[tokio::test]
    async fn test_decay_closed_form() {
        let (trust, _tmp) = setup().await;
        let interval = 3600i64;

        // Seed a client at 0.9 with last_updated_at = 0.
        trust.get_at("agent", 0).await.unwrap();
        let mut score = trust.storage.get_trust("agent").await.unwrap().unwrap();
        score.value = 0.9;
        score.last_updated_at = 0;
        trust.storage.save_trust(&score).await.unwrap();

        // Three missed intervals catch up in one read.
        let decayed = trust.get_at("agent", 3 * interval).await.unwrap();
        let expected = 0.5 + (0.9 - 0.5) * 0.95f64.powi(3);
        assert!((decayed.value - expected).abs() < 1e-6);
        assert_eq!(decayed.last_updated_at, 3 * interval);

        // Reading again at the same instant changes nothing (idempotent).
        let again = trust.get_at("agent", 3 * interval).await.unwrap();
        assert!((again.value - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_decay_tick_sweeps_stale_rows() {
        let (trust, _tmp) = setup().await;

        trust.get_at("agent", 0).await.unwrap();
        let mut score = trust.storage.get_trust("agent").await.unwrap().unwrap();
        score.value = 0.8;
        score.last_updated_at = 0;
        trust.storage.save_trust(&score).await.unwrap();

        let visited = trust.apply_decay_tick(7200).await.unwrap();
        assert_eq!(visited, 1);

        let score = trust.storage.get_trust("agent").await.unwrap().unwrap();
        let expected = 0.5 + (0.8 - 0.5) * 0.95f64.powi(2);
        assert!((score.value - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejections_floor_at_min_trust() {
        let (trust, _tmp) = setup().await;

        let mut last = 0.0;
        for i in 0..40 {
            let score = trust
                .update_on_report("bad-agent", ReportOutcome::Rejected, 100 + i)
                .await
                .unwrap();
            last = score.value;
            assert!(score.value >= 0.1, "trust fell below min: {}", score.value);
            assert!(score.value <= 1.0);
        }
        // Trends toward the floor, bounded below by min_trust.
        assert!(last < 0.25, "expected low trust, got {}", last);
    }

    #[tokio::test]
    async fn test_accepted_reports_raise_trust() {
        let (trust, _tmp) = setup().await;

        // A responsive client with a clean record climbs above the initial value.
        trust.register_heartbeat("good-agent", 999).await.unwrap();
        let mut value = 0.5;
        for i in 0..10 {
            trust
                .register_heartbeat("good-agent", 1_000 + i)
                .await
                .unwrap();
            let score = trust
                .update_on_report("good-agent", ReportOutcome::Accepted, 1_000 + i)
                .await
                .unwrap();
            value = score.value;
        }
        assert!(value > 0.5, "expected trust above initial, got {}", value);
    }

    #[tokio::test]
    async fn test_counters_by_outcome() {
        let (trust, _tmp) = setup().await;

        trust
            .update_on_report("agent", ReportOutcome::Submitted, 100)
            .await
            .unwrap();
        trust
            .update_on_report("agent", ReportOutcome::Submitted, 110)
            .await
            .unwrap();
        trust
            .update_on_report("agent", ReportOutcome::Accepted, 120)
            .await
            .unwrap();
        let score = trust
            .update_on_report("agent", ReportOutcome::Rejected, 130)
            .await
            .unwrap();

        assert_eq!(score.reports_total, 2);
        assert_eq!(score.reports_accepted, 1);
        assert_eq!(score.reports_rejected, 1);

        let history = trust.history("agent", 10).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].reason, TrustEventReason::Rejected);
        assert_eq!(history[3].reason, TrustEventReason::Report);
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_change_value() {
        let (trust, _tmp) = setup().await;

        let before = trust.get_at("agent", 100).await.unwrap();
        trust.register_heartbeat("agent", 150).await.unwrap();
        let after = trust.storage.get_trust("agent").await.unwrap().unwrap();

        assert_eq!(before.value, after.value);
        assert_eq!(after.last_heartbeat_at, Some(150));
        // The decay clock is untouched by heartbeats.
        assert_eq!(after.last_updated_at, before.last_updated_at);
    }

    #[tokio::test]
    async fn test_reset_writes_manual_event() {
        let (trust, _tmp) = setup().await;

        trust
            .update_on_report("agent", ReportOutcome::Rejected, 100)
            .await
            .unwrap();
        let reset = trust.reset("agent", 200).await.unwrap();
        assert_eq!(reset.value, 0.5);

        let history = trust.history("agent", 1).await.unwrap();
        assert_eq!(history[0].reason, TrustEventReason::Manual);
    }

    #[tokio::test]
    async fn test_mean_trust() {
        let (trust, _tmp) = setup().await;

        trust.get_at("a", 100).await.unwrap();
        trust.get_at("b", 100).await.unwrap();

        let mean = trust
            .mean_trust(&["a".to_string(), "b".to_string()], 100)
            .await
            .unwrap();
        assert!((mean - 0.5).abs() < 1e-12);

        assert_eq!(trust.mean_trust(&[], 100).await.unwrap(), 0.0);
    }
}
