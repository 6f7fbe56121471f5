//! Trust score and trust event storage operations.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use threatnet_core::{TrustEvent, TrustEventReason, TrustScore};

use super::Storage;

fn trust_from_row(row: &SqliteRow) -> Result<TrustScore> {
    let reports_total: i64 = row.get("reports_total");
    let reports_accepted: i64 = row.get("reports_accepted");
    let reports_rejected: i64 = row.get("reports_rejected");

    Ok(TrustScore {
        client_id: row.get("client_id"),
        value: row.get("value"),
        reports_total: reports_total.max(0) as u64,
        reports_accepted: reports_accepted.max(0) as u64,
        reports_rejected: reports_rejected.max(0) as u64,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        last_updated_at: row.get("last_updated_at"),
        created_at: row.get("created_at"),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<TrustEvent> {
    let reason: String = row.get("reason");
    let reason: TrustEventReason = reason
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid reason in trust_events row: {}", e))?;

    Ok(TrustEvent {
        client_id: row.get("client_id"),
        at: row.get("at"),
        delta: row.get("delta"),
        reason,
    })
}

impl Storage {
    /// Fetch a client's trust row, if it exists.
    pub async fn get_trust(&self, client_id: &str) -> Result<Option<TrustScore>> {
        let row = sqlx::query(
            r#"
            SELECT client_id, value, reports_total, reports_accepted, reports_rejected,
                   last_heartbeat_at, last_updated_at, created_at
            FROM trust_scores
            WHERE client_id = ?
            "#,
        )
        .bind(client_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to fetch trust score")?;

        row.as_ref().map(trust_from_row).transpose()
    }

    /// Create a trust row at the initial value if the client is unknown.
    ///
    /// Idempotent: an existing row is left untouched.
    pub async fn init_trust(&self, client_id: &str, initial: f64, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trust_scores (client_id, value, last_updated_at, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(client_id) DO NOTHING
            "#,
        )
        .bind(client_id)
        .bind(initial)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to initialize trust score")?;

        Ok(())
    }

    /// Persist a trust row (all mutable columns).
    pub async fn save_trust(&self, score: &TrustScore) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trust_scores
            SET value = ?,
                reports_total = ?,
                reports_accepted = ?,
                reports_rejected = ?,
                last_heartbeat_at = ?,
                last_updated_at = ?
            WHERE client_id = ?
            "#,
        )
        .bind(score.value)
        .bind(score.reports_total as i64)
        .bind(score.reports_accepted as i64)
        .bind(score.reports_rejected as i64)
        .bind(score.last_heartbeat_at)
        .bind(score.last_updated_at)
        .bind(&score.client_id)
        .execute(self.pool())
        .await
        .context("Failed to save trust score")?;

        Ok(())
    }

    /// Append one entry to the trust audit log.
    pub async fn append_trust_event(&self, event: &TrustEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trust_events (client_id, at, delta, reason)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&event.client_id)
        .bind(event.at)
        .bind(event.delta)
        .bind(event.reason.as_str())
        .execute(self.pool())
        .await
        .context("Failed to append trust event")?;

        Ok(())
    }

    /// Recent trust events for a client, newest first.
    pub async fn trust_history(&self, client_id: &str, limit: i64) -> Result<Vec<TrustEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, at, delta, reason
            FROM trust_events
            WHERE client_id = ?
            ORDER BY at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(client_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("Failed to fetch trust history")?;

        rows.iter().map(event_from_row).collect()
    }

    /// The last `k` accepted/rejected outcomes for a client as 1.0/0.0
    /// samples, newest first. Feeds the consistency factor.
    pub async fn recent_outcomes(&self, client_id: &str, k: i64) -> Result<Vec<f64>> {
        let reasons = sqlx::query_scalar::<_, String>(
            r#"
            SELECT reason
            FROM trust_events
            WHERE client_id = ?
              AND reason IN ('accepted', 'rejected')
            ORDER BY at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(client_id)
        .bind(k)
        .fetch_all(self.pool())
        .await
        .context("Failed to fetch recent outcomes")?;

        Ok(reasons
            .into_iter()
            .map(|r| if r == "accepted" { 1.0 } else { 0.0 })
            .collect())
    }

    /// All trust rows (dashboard snapshot).
    pub async fn all_trust_scores(&self) -> Result<Vec<TrustScore>> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, value, reports_total, reports_accepted, reports_rejected,
                   last_heartbeat_at, last_updated_at, created_at
            FROM trust_scores
            ORDER BY client_id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await
        .context("Failed to fetch trust scores")?;

        rows.iter().map(trust_from_row).collect()
    }

    /// Clients whose `last_updated_at` is at or before `cutoff` (decay candidates).
    pub async fn stale_trust_clients(&self, cutoff: i64) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT client_id
            FROM trust_scores
            WHERE last_updated_at <= ?
            ORDER BY client_id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .context("Failed to list stale trust rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn setup_storage() -> (Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        (storage, temp_db)
    }

    #[tokio::test]
    async fn test_init_trust_idempotent() {
        let (storage, _tmp) = setup_storage().await;

        storage.init_trust("agent-1", 0.5, 100).await.unwrap();
        storage.init_trust("agent-1", 0.9, 200).await.unwrap();

        let score = storage.get_trust("agent-1").await.unwrap().unwrap();
        assert_eq!(score.value, 0.5);
        assert_eq!(score.created_at, 100);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trust_scores")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let (storage, _tmp) = setup_storage().await;

        storage.init_trust("agent-1", 0.5, 100).await.unwrap();
        let mut score = storage.get_trust("agent-1").await.unwrap().unwrap();
        score.value = 0.72;
        score.reports_total = 3;
        score.reports_accepted = 2;
        score.last_heartbeat_at = Some(150);
        score.last_updated_at = 160;
        storage.save_trust(&score).await.unwrap();

        let reloaded = storage.get_trust("agent-1").await.unwrap().unwrap();
        assert_eq!(reloaded, score);
    }

    #[tokio::test]
    async fn test_recent_outcomes_window() {
        let (storage, _tmp) = setup_storage().await;

        storage.init_trust("agent-1", 0.5, 100).await.unwrap();
        for (at, reason) in [
            (110, TrustEventReason::Report),
            (120, TrustEventReason::Accepted),
            (130, TrustEventReason::Rejected),
            (140, TrustEventReason::Accepted),
            (150, TrustEventReason::Decay),
        ] {
            storage
                .append_trust_event(&TrustEvent {
                    client_id: "agent-1".to_string(),
                    at,
                    delta: 0.0,
                    reason,
                })
                .await
                .unwrap();
        }

        // Only accepted/rejected count; newest first.
        let outcomes = storage.recent_outcomes("agent-1", 2).await.unwrap();
        assert_eq!(outcomes, vec![1.0, 0.0]);

        let all = storage.recent_outcomes("agent-1", 20).await.unwrap();
        assert_eq!(all, vec![1.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_stale_trust_clients() {
        let (storage, _tmp) = setup_storage().await;

        storage.init_trust("fresh", 0.5, 1_000).await.unwrap();
        storage.init_trust("stale", 0.5, 10).await.unwrap();

        let stale = storage.stale_trust_clients(500).await.unwrap();
        assert_eq!(stale, vec!["stale".to_string()]);
    }
}
