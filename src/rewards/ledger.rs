use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rewards::storage;

/// Current ledger document version
const LEDGER_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Positive entry from learning-app usage
    Accrual,
    /// Negative entry spending points on reward time
    Redemption,
    /// Manual parent correction, either sign
    Adjustment,
}

/// One immutable, signed movement of points for a child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub child_id: String,
    pub app_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// Audit record for the low-frequency mutations. Redemptions and adjustments
/// are audited; accruals are too chatty to be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub child_id: String,
    pub action: String,
    pub details: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// On-disk shape of the ledger.
#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    version: String,
    entries: Vec<LedgerEntry>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    audit: Vec<AuditEntry>,
}

/// Append-only store of point transactions per child.
///
/// The ledger is the single source of truth read by accrual, redemption, and
/// the query paths. Clones share one mutex-guarded store, so every mutation
/// is serialized and a balance read issued after a write always observes
/// that write. Entries are never edited or deleted individually; `clear` is
/// the only bulk destructor.
#[derive(Clone, Default)]
pub struct PointsLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl PointsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positive accrual entry. Not audited.
    pub async fn record_accrual(
        &self,
        child_id: &str,
        app_id: Option<String>,
        points: i64,
        timestamp: Option<DateTime<Utc>>,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            child_id: child_id.to_string(),
            app_id,
            kind: EntryKind::Accrual,
            amount: points,
            timestamp: timestamp.unwrap_or_else(Utc::now),
        };
        let mut inner = self.inner.lock().await;
        inner.entries.push(entry.clone());
        debug!(child = child_id, points, "accrual recorded");
        entry
    }

    /// Append a redemption entry. `points` is the positive magnitude being
    /// spent; the stored amount is negative. Writes an audit record.
    pub async fn record_redemption(
        &self,
        child_id: &str,
        app_id: Option<String>,
        points: i64,
        timestamp: Option<DateTime<Utc>>,
    ) -> LedgerEntry {
        let at = timestamp.unwrap_or_else(Utc::now);
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            child_id: child_id.to_string(),
            app_id,
            kind: EntryKind::Redemption,
            amount: -points,
            timestamp: at,
        };
        let mut inner = self.inner.lock().await;
        inner.entries.push(entry.clone());
        inner.audit.push(AuditEntry {
            child_id: child_id.to_string(),
            action: "redemption".to_string(),
            details: HashMap::from([("points".to_string(), (-points).to_string())]),
            timestamp: at,
        });
        info!(child = child_id, points, "redemption recorded");
        entry
    }

    /// Append a signed manual adjustment. Writes an audit record carrying
    /// the reason.
    pub async fn record_adjustment(
        &self,
        child_id: &str,
        app_id: Option<String>,
        points: i64,
        reason: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> LedgerEntry {
        let at = timestamp.unwrap_or_else(Utc::now);
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            child_id: child_id.to_string(),
            app_id,
            kind: EntryKind::Adjustment,
            amount: points,
            timestamp: at,
        };
        let mut inner = self.inner.lock().await;
        inner.entries.push(entry.clone());
        inner.audit.push(AuditEntry {
            child_id: child_id.to_string(),
            action: "adjustment".to_string(),
            details: HashMap::from([
                ("points".to_string(), points.to_string()),
                ("reason".to_string(), reason.to_string()),
            ]),
            timestamp: at,
        });
        info!(child = child_id, points, reason, "adjustment recorded");
        entry
    }

    /// Sum of matching entry amounts. With an app the sum is restricted to
    /// that app's entries; with `None` it covers every entry for the child,
    /// app-tagged or not.
    pub async fn balance(&self, child_id: &str, app_id: Option<&str>) -> i64 {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.child_id == child_id)
            .filter(|e| app_id.is_none() || e.app_id.as_deref() == app_id)
            .map(|e| e.amount)
            .sum()
    }

    /// Per-app balances. Only entries that carry an app appear here; app-less
    /// entries still count toward the global balance but are absent from
    /// this map.
    pub async fn balances(&self, child_id: &str) -> HashMap<String, i64> {
        let inner = self.inner.lock().await;
        let mut out: HashMap<String, i64> = HashMap::new();
        for entry in inner.entries.iter().filter(|e| e.child_id == child_id) {
            if let Some(app) = &entry.app_id {
                *out.entry(app.clone()).or_insert(0) += entry.amount;
            }
        }
        out
    }

    /// Entries for a child, most recent first.
    pub async fn entries(&self, child_id: &str, limit: Option<usize>) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().await;
        let mut matched: Vec<LedgerEntry> = inner
            .entries
            .iter()
            .filter(|e| e.child_id == child_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        matched
    }

    /// Entries whose timestamp falls in `[from, to]`, bounds inclusive.
    pub async fn entries_in_range(
        &self,
        child_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| e.child_id == child_id && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    /// Entries from the current local calendar day.
    pub async fn today_entries(&self, child_id: &str) -> Vec<LedgerEntry> {
        let today = Local::now().date_naive();
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|e| {
                e.child_id == child_id && e.timestamp.with_timezone(&Local).date_naive() == today
            })
            .cloned()
            .collect()
    }

    /// Points accrued today: accrual-kind entries only, redemptions and
    /// adjustments excluded.
    pub async fn today_accrual(&self, child_id: &str) -> i64 {
        self.today_entries(child_id)
            .await
            .iter()
            .filter(|e| e.kind == EntryKind::Accrual)
            .map(|e| e.amount)
            .sum()
    }

    /// Audit trail for a child, oldest first.
    pub async fn audit_log(&self, child_id: &str) -> Vec<AuditEntry> {
        let inner = self.inner.lock().await;
        inner
            .audit
            .iter()
            .filter(|a| a.child_id == child_id)
            .cloned()
            .collect()
    }

    /// Irreversibly drop every entry and audit record.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.audit.clear();
        info!("ledger cleared");
    }

    /// Persist the full entry set. The snapshot is taken under the lock, so
    /// writers racing this call land either fully before or fully after it;
    /// the file itself is written atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let document = {
            let inner = self.inner.lock().await;
            LedgerDocument {
                version: LEDGER_VERSION.to_string(),
                entries: inner.entries.clone(),
                audit: inner.audit.clone(),
            }
        };

        let content = serde_json::to_string_pretty(&document)
            .context("Failed to serialize ledger")?;
        storage::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write ledger file: {}", path.display()))?;
        Ok(())
    }

    /// Replace in-memory state with the persisted entry set. The document is
    /// read and validated before any state is touched, so a failed load
    /// leaves the current entries intact.
    pub async fn load(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ledger file: {}", path.display()))?;
        let document: LedgerDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse ledger file: {}", path.display()))?;

        if document.version != LEDGER_VERSION {
            anyhow::bail!(
                "Ledger file version mismatch (expected {}, got {}): {}",
                LEDGER_VERSION,
                document.version,
                path.display()
            );
        }

        let mut inner = self.inner.lock().await;
        inner.entries = document.entries;
        inner.audit = document.audit;
        debug!(entries = inner.entries.len(), "ledger loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_balance_is_sum_of_matching_amounts() {
        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 50, None).await;
        ledger
            .record_accrual("kid1", Some("math".to_string()), 30, None)
            .await;
        ledger.record_accrual("kid2", None, 99, None).await;

        assert_eq!(ledger.balance("kid1", None).await, 80);
        assert_eq!(ledger.balance("kid1", Some("math")).await, 30);
        assert_eq!(ledger.balance("kid2", None).await, 99);
        assert_eq!(ledger.balance("nobody", None).await, 0);
    }

    #[tokio::test]
    async fn test_identical_accruals_are_distinct_entries() {
        let ledger = PointsLedger::new();
        let at = Utc::now();
        let a = ledger.record_accrual("kid1", None, 25, Some(at)).await;
        let b = ledger.record_accrual("kid1", None, 25, Some(at)).await;

        // No deduplication: both entries exist and both count.
        assert_ne!(a.id, b.id);
        assert_eq!(ledger.entries("kid1", None).await.len(), 2);
        assert_eq!(ledger.balance("kid1", None).await, 50);
    }

    #[tokio::test]
    async fn test_redemption_stores_negative_amount_and_audits() {
        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 200, None).await;
        let entry = ledger.record_redemption("kid1", None, 120, None).await;

        assert_eq!(entry.amount, -120);
        assert_eq!(ledger.balance("kid1", None).await, 80);

        let audit = ledger.audit_log("kid1").await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "redemption");
        assert_eq!(audit[0].details.get("points"), Some(&"-120".to_string()));
    }

    #[tokio::test]
    async fn test_adjustment_audits_with_reason() {
        let ledger = PointsLedger::new();
        ledger
            .record_adjustment("kid1", None, -15, "screen time argument", None)
            .await;

        let audit = ledger.audit_log("kid1").await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "adjustment");
        assert_eq!(audit[0].details.get("points"), Some(&"-15".to_string()));
        assert_eq!(
            audit[0].details.get("reason"),
            Some(&"screen time argument".to_string())
        );
    }

    #[tokio::test]
    async fn test_accrual_is_not_audited() {
        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 10, None).await;
        assert!(ledger.audit_log("kid1").await.is_empty());
    }

    #[tokio::test]
    async fn test_balances_map_excludes_appless_entries() {
        let ledger = PointsLedger::new();
        ledger
            .record_accrual("kid1", Some("math".to_string()), 40, None)
            .await;
        ledger.record_accrual("kid1", None, 60, None).await;

        let balances = ledger.balances("kid1").await;
        assert_eq!(balances.len(), 1);
        assert_eq!(balances.get("math"), Some(&40));
        // The app-less entry still counts toward the global balance.
        assert_eq!(ledger.balance("kid1", None).await, 100);
    }

    #[tokio::test]
    async fn test_entries_most_recent_first_with_limit() {
        let ledger = PointsLedger::new();
        let base = Utc::now();
        for i in 0..5 {
            ledger
                .record_accrual("kid1", None, i, Some(base + Duration::seconds(i)))
                .await;
        }

        let entries = ledger.entries("kid1", Some(3)).await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].amount, 4);
        assert_eq!(entries[1].amount, 3);
        assert_eq!(entries[2].amount, 2);
    }

    #[tokio::test]
    async fn test_range_query_bounds_are_inclusive() {
        let ledger = PointsLedger::new();
        let base = Utc::now();
        ledger.record_accrual("kid1", None, 1, Some(base)).await;
        ledger
            .record_accrual("kid1", None, 2, Some(base + Duration::seconds(10)))
            .await;
        ledger
            .record_accrual("kid1", None, 3, Some(base + Duration::seconds(20)))
            .await;

        let hits = ledger
            .entries_in_range("kid1", base, base + Duration::seconds(10))
            .await;
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_today_accrual_counts_accruals_only() {
        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 70, None).await;
        ledger.record_redemption("kid1", None, 30, None).await;
        ledger.record_adjustment("kid1", None, 5, "bonus", None).await;

        assert_eq!(ledger.today_accrual("kid1").await, 70);
        assert_eq!(ledger.today_entries("kid1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 80, None).await;
        ledger.record_redemption("kid1", None, 20, None).await;
        ledger.save(&path).await.unwrap();

        let restored = PointsLedger::new();
        restored.load(&path).await.unwrap();
        assert_eq!(restored.balance("kid1", None).await, 60);
        assert_eq!(restored.entries("kid1", None).await.len(), 2);
        assert_eq!(restored.audit_log("kid1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "not json at all").unwrap();

        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 42, None).await;

        assert!(ledger.load(&path).await.is_err());
        assert_eq!(ledger.balance("kid1", None).await, 42);
    }

    #[tokio::test]
    async fn test_load_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"version":"9.9","entries":[],"audit":[]}"#,
        )
        .unwrap();

        let ledger = PointsLedger::new();
        assert!(ledger.load(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let ledger = PointsLedger::new();
        ledger.record_accrual("kid1", None, 10, None).await;
        ledger.record_redemption("kid1", None, 5, None).await;

        ledger.clear().await;
        assert_eq!(ledger.balance("kid1", None).await, 0);
        assert!(ledger.entries("kid1", None).await.is_empty());
        assert!(ledger.audit_log("kid1").await.is_empty());
    }
}
