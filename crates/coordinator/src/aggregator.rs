//! Intelligence Aggregator: IOC deduplication and trust-weighted consensus.
//!
//! Submissions for one fingerprint are serialized by a lock stripe; the row
//! mutation plus the provenance insert run in a single transaction, and
//! promotion is gated by a `WHERE status = 'pending'` row-count check so
//! `newly_verified` fires exactly once per verification window.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use threatnet_core::{
    canonicalize, fingerprint, CoreError, Ioc, IocFilter, IocId, IocPayload, IocStatus, IocType,
    ReportOutcome, SubmitResult, ThreatLevel,
};
use threatnet_engine::ConsensusPolicy;

use crate::config::IntelConfig;
use crate::locks::KeyedLocks;
use crate::now_ts;
use crate::outcome::OutcomeEvent;
use crate::storage::{DatabaseStats, Storage};
use crate::trust::TrustManager;

/// Submission failure.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Malformed payload; maps to `bad_request` at the boundary.
    #[error(transparent)]
    Invalid(#[from] CoreError),

    /// Store failure; maps to `internal` at the boundary.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Explicit expiry failure.
#[derive(Debug, thiserror::Error)]
pub enum ExpireError {
    /// No such IOC.
    #[error("IOC not found")]
    NotFound,

    /// The IOC is already expired; maps to `conflict` at the boundary.
    #[error("IOC already expired")]
    AlreadyExpired,

    /// Store failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of the transactional report write.
#[derive(Debug, Clone, Copy)]
struct ReportWrite {
    created: bool,
    new_report: bool,
    status: IocStatus,
    threat_level: ThreatLevel,
}

/// Stateful IOC engine.
#[derive(Debug)]
pub struct IntelAggregator {
    storage: Storage,
    trust: Arc<TrustManager>,
    policy: ConsensusPolicy,
    config: IntelConfig,
    locks: KeyedLocks,
    outcomes: mpsc::Sender<OutcomeEvent>,
}

impl IntelAggregator {
    /// Create an aggregator over the given store.
    ///
    /// The aggregator only reads trust (`get`/`mean`); all trust mutations
    /// flow through the outcome channel.
    pub fn new(
        storage: Storage,
        trust: Arc<TrustManager>,
        policy: ConsensusPolicy,
        config: IntelConfig,
        outcomes: mpsc::Sender<OutcomeEvent>,
    ) -> Self {
        Self {
            storage,
            trust,
            policy,
            config,
            locks: KeyedLocks::default(),
            outcomes,
        }
    }

    /// Submit one IOC report. Idempotent on `(client_id, ioc_id)`.
    pub async fn submit(
        &self,
        client_id: &str,
        payload: &IocPayload,
    ) -> Result<SubmitResult, SubmitError> {
        self.submit_at(client_id, payload, now_ts()).await
    }

    /// [`IntelAggregator::submit`] with an explicit clock.
    pub async fn submit_at(
        &self,
        client_id: &str,
        payload: &IocPayload,
        now: i64,
    ) -> Result<SubmitResult, SubmitError> {
        if client_id.trim().is_empty() {
            return Err(CoreError::EmptyClientId.into());
        }

        let ioc_type: IocType = payload.ioc_type.parse()?;
        let threat_level: ThreatLevel = match payload.threat_level.as_deref() {
            Some(s) => s.parse()?,
            None => ThreatLevel::Medium,
        };
        let value = canonicalize(ioc_type, &payload.value)?;
        let ioc_id = fingerprint(ioc_type, &value);

        // Trust snapshot for the provenance row; creates unknown clients.
        let reporter_trust = self
            .trust
            .get_at(client_id, now)
            .await
            .context("Failed to read reporter trust")?;

        let _guard = self.locks.lock(ioc_id.as_str()).await;

        let write = self
            .write_report(
                &ioc_id,
                client_id,
                ioc_type,
                threat_level,
                &value,
                &payload.metadata,
                reporter_trust.value,
                now,
            )
            .await?;

        if write.new_report {
            // Counts toward the contribution factor; duplicates do not, so
            // that re-submitting identical arguments leaves the same end
            // state everywhere.
            self.send_outcome(client_id, ReportOutcome::Submitted, now)
                .await;
        } else {
            return Ok(SubmitResult {
                ioc_id,
                created: false,
                status: write.status,
                newly_verified: false,
            });
        }

        let mut status = IocStatus::Pending;
        let mut newly_verified = false;
        if write.status == IocStatus::Verified {
            status = IocStatus::Verified;
        } else {
            let reporters = self
                .storage
                .reporters_of(&ioc_id)
                .await
                .context("Failed to list reporters for consensus")?;
            let mean_trust = self
                .trust
                .mean_trust(&reporters, now)
                .await
                .context("Failed to compute mean reporter trust")?;

            if threatnet_engine::evaluate(
                reporters.len() as u64,
                mean_trust,
                // The stored level governs promotion; later reports do not
                // re-grade an existing IOC.
                write.threat_level,
                &self.policy,
            ) {
                // The status guard makes promotion single-shot even if the
                // predicate holds across several submissions.
                let updated = sqlx::query(
                    r#"
                    UPDATE iocs
                    SET status = 'verified', verified_at = ?
                    WHERE ioc_id = ? AND status = 'pending'
                    "#,
                )
                .bind(now)
                .bind(ioc_id.as_str())
                .execute(self.storage.pool())
                .await
                .context("Failed to promote IOC")?;

                if updated.rows_affected() == 1 {
                    newly_verified = true;
                    status = IocStatus::Verified;
                    info!(
                        ioc_id = %ioc_id,
                        reporters = reporters.len(),
                        mean_trust = format_args!("{:.2}", mean_trust),
                        "IOC verified by consensus"
                    );
                    for reporter in &reporters {
                        self.send_outcome(reporter, ReportOutcome::Accepted, now)
                            .await;
                    }
                }
            }
        }

        Ok(SubmitResult {
            ioc_id,
            created: write.created,
            status,
            newly_verified,
        })
    }

    /// Fetch a single IOC.
    pub async fn get(&self, ioc_id: &IocId) -> Result<Option<Ioc>> {
        self.storage.get_ioc(ioc_id).await
    }

    /// Query IOCs by filter.
    pub async fn query(&self, filter: &IocFilter) -> Result<Vec<Ioc>> {
        self.storage.query_iocs(filter).await
    }

    /// Verified IOCs with `verified_at > cursor` in verification order, plus
    /// the new cursor (unchanged when nothing matched).
    pub async fn pull_since(&self, cursor: i64) -> Result<(Vec<Ioc>, i64)> {
        let iocs = self.storage.verified_since(cursor, -1).await?;
        let new_cursor = iocs
            .last()
            .and_then(|ioc| ioc.verified_at)
            .unwrap_or(cursor);
        Ok((iocs, new_cursor))
    }

    /// The most recent verified IOCs plus the matching cursor, for clients
    /// with no sync history.
    pub async fn recent_verified(&self) -> Result<(Vec<Ioc>, i64)> {
        let iocs = self
            .storage
            .recent_verified(self.config.initial_snapshot_limit as i64)
            .await?;
        let cursor = iocs.last().and_then(|ioc| ioc.verified_at).unwrap_or(0);
        Ok((iocs, cursor))
    }

    /// Expire stale pending IOCs and debit their reporters. Returns how many
    /// rows were expired.
    pub async fn expire_sweep(&self) -> Result<u64> {
        self.expire_sweep_at(now_ts()).await
    }

    /// [`IntelAggregator::expire_sweep`] with an explicit clock.
    pub async fn expire_sweep_at(&self, now: i64) -> Result<u64> {
        let cutoff = now - self.config.ioc_ttl_secs as i64;
        let stale = self.storage.pending_older_than(cutoff).await?;

        let mut expired = 0u64;
        for ioc_id in stale {
            let _guard = self.locks.lock(ioc_id.as_str()).await;

            // Re-check under the lock; a fresh report may have arrived.
            let updated = sqlx::query(
                r#"
                UPDATE iocs
                SET status = 'expired'
                WHERE ioc_id = ? AND status = 'pending' AND last_seen < ?
                "#,
            )
            .bind(ioc_id.as_str())
            .bind(cutoff)
            .execute(self.storage.pool())
            .await
            .context("Failed to expire stale IOC")?;

            if updated.rows_affected() == 1 {
                expired += 1;
                let reporters = self.storage.reporters_of(&ioc_id).await?;
                for reporter in &reporters {
                    self.send_outcome(reporter, ReportOutcome::Rejected, now)
                        .await;
                }
                info!(ioc_id = %ioc_id, reporters = reporters.len(), "IOC expired unverified");
            }
        }

        Ok(expired)
    }

    /// Explicit administrative expiry.
    ///
    /// Reporters are debited only when the IOC never reached `verified`.
    pub async fn expire(&self, ioc_id: &IocId, now: i64) -> Result<Ioc, ExpireError> {
        let _guard = self.locks.lock(ioc_id.as_str()).await;

        let ioc = self
            .storage
            .get_ioc(ioc_id)
            .await
            .context("Failed to fetch IOC for expiry")?
            .ok_or(ExpireError::NotFound)?;

        if ioc.status == IocStatus::Expired {
            return Err(ExpireError::AlreadyExpired);
        }

        sqlx::query("UPDATE iocs SET status = 'expired' WHERE ioc_id = ?")
            .bind(ioc_id.as_str())
            .execute(self.storage.pool())
            .await
            .context("Failed to expire IOC")?;

        if ioc.status == IocStatus::Pending {
            let reporters = self.storage.reporters_of(ioc_id).await.unwrap_or_default();
            for reporter in &reporters {
                self.send_outcome(reporter, ReportOutcome::Rejected, now)
                    .await;
            }
        }

        info!(ioc_id = %ioc_id, was = ioc.status.as_str(), "IOC expired by admin");

        self.storage
            .get_ioc(ioc_id)
            .await
            .context("Failed to re-fetch expired IOC")?
            .ok_or(ExpireError::NotFound)
    }

    /// IOC and client totals for the status endpoint.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        self.storage.stats().await
    }

    /// Write the IOC row and the provenance row in one transaction.
    ///
    /// `new_report` is false for a duplicate `(ioc_id, client_id)`
    /// submission; `status` and `threat_level` reflect the stored row after
    /// the write (an expired row is re-opened as pending first).
    #[allow(clippy::too_many_arguments)]
    async fn write_report(
        &self,
        ioc_id: &IocId,
        client_id: &str,
        ioc_type: IocType,
        threat_level: ThreatLevel,
        value: &str,
        metadata: &HashMap<String, String>,
        reporter_trust: f64,
        now: i64,
    ) -> Result<ReportWrite> {
        let mut tx = self
            .storage
            .pool()
            .begin()
            .await
            .context("Failed to begin submit transaction")?;

        let existing = sqlx::query_as::<_, (String, String, String)>(
            "SELECT status, metadata, threat_level FROM iocs WHERE ioc_id = ?",
        )
        .bind(ioc_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to read IOC row")?;

        let write = match existing {
            None => {
                let metadata_json =
                    serde_json::to_string(metadata).context("Failed to encode metadata")?;
                sqlx::query(
                    r#"
                    INSERT INTO iocs (ioc_id, ioc_type, value, threat_level, status,
                                      first_seen, last_seen, report_count, verified_at, metadata)
                    VALUES (?, ?, ?, ?, 'pending', ?, ?, 1, NULL, ?)
                    "#,
                )
                .bind(ioc_id.as_str())
                .bind(ioc_type.as_str())
                .bind(value)
                .bind(threat_level.as_str())
                .bind(now)
                .bind(now)
                .bind(&metadata_json)
                .execute(&mut *tx)
                .await
                .context("Failed to insert IOC")?;

                insert_report(&mut tx, ioc_id, client_id, reporter_trust, now).await?;

                ReportWrite {
                    created: true,
                    new_report: true,
                    status: IocStatus::Pending,
                    threat_level,
                }
            }
            Some((status, metadata_json, stored_level)) => {
                let mut status: IocStatus = status
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid status in iocs row: {}", e))?;
                let stored_level: ThreatLevel = stored_level
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid threat_level in iocs row: {}", e))?;

                if status == IocStatus::Expired {
                    // Re-opened window: prior provenance is cleared so the
                    // distinct-reporter count restarts and verification can
                    // fire again.
                    sqlx::query("DELETE FROM ioc_reports WHERE ioc_id = ?")
                        .bind(ioc_id.as_str())
                        .execute(&mut *tx)
                        .await
                        .context("Failed to clear reports of expired IOC")?;
                    sqlx::query(
                        r#"
                        UPDATE iocs
                        SET status = 'pending', verified_at = NULL, report_count = 0
                        WHERE ioc_id = ?
                        "#,
                    )
                    .bind(ioc_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context("Failed to re-open expired IOC")?;
                    status = IocStatus::Pending;
                }

                let mut merged: HashMap<String, String> = serde_json::from_str(&metadata_json)
                    .context("Invalid metadata JSON in iocs row")?;
                merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                let merged_json =
                    serde_json::to_string(&merged).context("Failed to encode metadata")?;

                let already_reported: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM ioc_reports WHERE ioc_id = ? AND client_id = ?",
                )
                .bind(ioc_id.as_str())
                .bind(client_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to check for existing report")?;

                if already_reported.is_some() {
                    sqlx::query("UPDATE iocs SET last_seen = ?, metadata = ? WHERE ioc_id = ?")
                        .bind(now)
                        .bind(&merged_json)
                        .bind(ioc_id.as_str())
                        .execute(&mut *tx)
                        .await
                        .context("Failed to refresh IOC on duplicate report")?;

                    ReportWrite {
                        created: false,
                        new_report: false,
                        status,
                        threat_level: stored_level,
                    }
                } else {
                    insert_report(&mut tx, ioc_id, client_id, reporter_trust, now).await?;
                    sqlx::query(
                        r#"
                        UPDATE iocs
                        SET report_count = report_count + 1, last_seen = ?, metadata = ?
                        WHERE ioc_id = ?
                        "#,
                    )
                    .bind(now)
                    .bind(&merged_json)
                    .bind(ioc_id.as_str())
                    .execute(&mut *tx)
                    .await
                    .context("Failed to update IOC for new reporter")?;

                    ReportWrite {
                        created: false,
                        new_report: true,
                        status,
                        threat_level: stored_level,
                    }
                }
            }
        };

        tx.commit()
            .await
            .context("Failed to commit submit transaction")?;

        Ok(write)
    }

    async fn send_outcome(&self, client_id: &str, outcome: ReportOutcome, at: i64) {
        let event = OutcomeEvent {
            client_id: client_id.to_string(),
            outcome,
            at,
        };
        if self.outcomes.send(event).await.is_err() {
            warn!(client_id, "outcome queue closed; trust update lost");
        }
    }
}

async fn insert_report(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ioc_id: &IocId,
    client_id: &str,
    reporter_trust: f64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ioc_reports (ioc_id, client_id, reported_at, reporter_trust_at_report)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(ioc_id, client_id) DO NOTHING
        "#,
    )
    .bind(ioc_id.as_str())
    .bind(client_id)
    .bind(now)
    .bind(reporter_trust)
    .execute(&mut **tx)
    .await
    .context("Failed to insert IOC report")?;

    Ok(())
}
