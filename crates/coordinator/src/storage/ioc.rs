//! IOC storage operations.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

use threatnet_core::{Ioc, IocFilter, IocId, IocStatus, IocType, ThreatLevel};

use super::Storage;

/// Map one `iocs` row into the domain type.
pub(crate) fn ioc_from_row(row: &SqliteRow) -> Result<Ioc> {
    let ioc_id: String = row.get("ioc_id");
    let ioc_type: String = row.get("ioc_type");
    let value: String = row.get("value");
    let threat_level: String = row.get("threat_level");
    let status: String = row.get("status");
    let first_seen: i64 = row.get("first_seen");
    let last_seen: i64 = row.get("last_seen");
    let report_count: i64 = row.get("report_count");
    let verified_at: Option<i64> = row.get("verified_at");
    let metadata_json: String = row.get("metadata");

    let ioc_type: IocType = ioc_type
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid ioc_type in iocs row: {}", e))?;
    let threat_level: ThreatLevel = threat_level
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid threat_level in iocs row: {}", e))?;
    let status: IocStatus = status
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid status in iocs row: {}", e))?;
    let metadata: HashMap<String, String> =
        serde_json::from_str(&metadata_json).context("Invalid metadata JSON in iocs row")?;

    Ok(Ioc {
        id: IocId::new(ioc_id),
        ioc_type,
        value,
        threat_level,
        status,
        first_seen,
        last_seen,
        report_count: report_count.max(0) as u64,
        verified_at,
        metadata,
    })
}

const IOC_COLUMNS: &str = "ioc_id, ioc_type, value, threat_level, status, \
                           first_seen, last_seen, report_count, verified_at, metadata";

impl Storage {
    /// Fetch a single IOC by fingerprint.
    pub async fn get_ioc(&self, id: &IocId) -> Result<Option<Ioc>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM iocs WHERE ioc_id = ?",
            IOC_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await
        .context("Failed to fetch IOC")?;

        row.as_ref().map(ioc_from_row).transpose()
    }

    /// Query IOCs by any combination of status, type, threat level, and
    /// last-seen lower bound. Filters are conjunctive.
    pub async fn query_iocs(&self, filter: &IocFilter) -> Result<Vec<Ioc>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM iocs
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR ioc_type = ?2)
              AND (?3 IS NULL OR threat_level = ?3)
              AND (?4 IS NULL OR last_seen >= ?4)
            ORDER BY last_seen DESC, ioc_id ASC
            "#,
            IOC_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.ioc_type.map(|t| t.as_str()))
        .bind(filter.threat_level.map(|l| l.as_str()))
        .bind(filter.since)
        .fetch_all(self.pool())
        .await
        .context("Failed to query IOCs")?;

        rows.iter().map(ioc_from_row).collect()
    }

    /// All verified IOCs with `verified_at > cursor`, in verification order.
    ///
    /// A `limit` of -1 means no limit.
    pub async fn verified_since(&self, cursor: i64, limit: i64) -> Result<Vec<Ioc>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM iocs
            WHERE status = 'verified'
              AND verified_at > ?
            ORDER BY verified_at ASC, ioc_id ASC
            LIMIT ?
            "#,
            IOC_COLUMNS
        ))
        .bind(cursor)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("Failed to fetch verified IOCs since cursor")?;

        rows.iter().map(ioc_from_row).collect()
    }

    /// The most recently verified IOCs, returned in verification order.
    ///
    /// Used for the initial snapshot sent to a client with no known cursor.
    pub async fn recent_verified(&self, limit: i64) -> Result<Vec<Ioc>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM iocs
            WHERE status = 'verified'
            ORDER BY verified_at DESC, ioc_id DESC
            LIMIT ?
            "#,
            IOC_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("Failed to fetch recent verified IOCs")?;

        let mut iocs: Vec<Ioc> = rows.iter().map(ioc_from_row).collect::<Result<_>>()?;
        iocs.reverse();
        Ok(iocs)
    }

    /// Fingerprints of pending IOCs whose `last_seen` is older than `cutoff`.
    pub async fn pending_older_than(&self, cutoff: i64) -> Result<Vec<IocId>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT ioc_id
            FROM iocs
            WHERE status = 'pending'
              AND last_seen < ?
            ORDER BY last_seen ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .context("Failed to list stale pending IOCs")?;

        Ok(ids.into_iter().map(IocId::new).collect())
    }

    /// Distinct client ids that reported an IOC.
    pub async fn reporters_of(&self, id: &IocId) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT client_id
            FROM ioc_reports
            WHERE ioc_id = ?
            ORDER BY reported_at ASC, client_id ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(self.pool())
        .await
        .context("Failed to list IOC reporters")
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

    async fn insert_raw_ioc(storage: &Storage, id: &str, status: &str, verified_at: Option<i64>) {
        sqlx::query(
            r#"
            INSERT INTO iocs (ioc_id, ioc_type, value, threat_level, status,
                              first_seen, last_seen, report_count, verified_at, metadata)
            VALUES (?, 'domain', ?, 'high', ?, 100, 100, 1, ?, '{}')
            "#,
        )
        .bind(id)
        .bind(format!("{}.example.com", id))
        .bind(status)
        .bind(verified_at)
        .execute(storage.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_ioc_roundtrip() {
        let (storage, _tmp) = setup_storage().await;

        insert_raw_ioc(&storage, "aaa", "pending", None).await;

        let ioc = storage.get_ioc(&IocId::new("aaa".into())).await.unwrap();
        let ioc = ioc.unwrap();
        assert_eq!(ioc.ioc_type, IocType::Domain);
        assert_eq!(ioc.status, IocStatus::Pending);
        assert_eq!(ioc.report_count, 1);

        let missing = storage
            .get_ioc(&IocId::new("missing".into()))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_query_iocs_filters() {
        let (storage, _tmp) = setup_storage().await;

        insert_raw_ioc(&storage, "v1", "verified", Some(200)).await;
        insert_raw_ioc(&storage, "p1", "pending", None).await;

        let all = storage.query_iocs(&IocFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let verified = storage
            .query_iocs(&IocFilter {
                status: Some(IocStatus::Verified),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].id.as_str(), "v1");

        let nothing = storage
            .query_iocs(&IocFilter {
                threat_level: Some(ThreatLevel::Low),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn test_verified_since_ordering_and_cursor() {
        let (storage, _tmp) = setup_storage().await;

        insert_raw_ioc(&storage, "v2", "verified", Some(300)).await;
        insert_raw_ioc(&storage, "v1", "verified", Some(200)).await;
        insert_raw_ioc(&storage, "p1", "pending", None).await;

        let all = storage.verified_since(0, -1).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id.as_str(), "v1");
        assert_eq!(all[1].id.as_str(), "v2");

        let after = storage.verified_since(200, -1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id.as_str(), "v2");
    }

    #[tokio::test]
    async fn test_pending_older_than() {
        let (storage, _tmp) = setup_storage().await;

        insert_raw_ioc(&storage, "old", "pending", None).await;
        insert_raw_ioc(&storage, "verified-old", "verified", Some(150)).await;

        let stale = storage.pending_older_than(101).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].as_str(), "old");

        // Verified rows never show up, however old.
        let stale = storage.pending_older_than(i64::MAX).await.unwrap();
        assert_eq!(stale.len(), 1);
    }
}
