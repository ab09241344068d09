use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::rewards::config::PointsConfig;
use crate::rewards::session::{UsageSession, calculate_points};

/// Scope of one daily counter: a child, an optional app, and the local
/// calendar day the points were earned on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccrualKey {
    child_id: String,
    app_id: Option<String>,
    day: String, // YYYY-MM-DD, local time
}

fn day_key(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

/// Converts finished usage sessions into capped daily point awards.
///
/// Counters are keyed by (child, app-or-none, day), so day rollover needs no
/// scheduled reset: a new day starts fresh counters and stale ones are pruned
/// on the next award. All mutation goes through one mutex; callers write the
/// awarded amount to the ledger themselves.
#[derive(Clone, Default)]
pub struct AccrualEngine {
    daily: Arc<Mutex<HashMap<AccrualKey, i64>>>,
}

impl AccrualEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish a session and compute its award, clipped to whatever remains
    /// of the daily cap for the session's scope. Returns the finalized
    /// session and the awarded points (possibly zero). Ending an
    /// already-ended session awards nothing; sessions are single-use.
    pub async fn end_session(
        &self,
        mut session: UsageSession,
        config: &PointsConfig,
        at: DateTime<Utc>,
    ) -> (UsageSession, i64) {
        if session.is_ended() {
            return (session, 0);
        }
        session.ended_at = Some(at);

        let raw = calculate_points(&session, config);
        let key = AccrualKey {
            child_id: session.child_id.clone(),
            app_id: session.app_id.clone(),
            day: day_key(at),
        };

        let mut daily = self.daily.lock().await;
        // Counters from earlier days no longer feed any cap decision.
        daily.retain(|k, _| k.day.as_str() >= key.day.as_str());

        // An app-tagged session is capped within its app scope; an app-less
        // one is capped against the child's global total for the day.
        let used = match &key.app_id {
            Some(_) => daily.get(&key).copied().unwrap_or(0),
            None => daily
                .iter()
                .filter(|(k, _)| k.child_id == key.child_id && k.day == key.day)
                .map(|(_, v)| v)
                .sum(),
        };
        let awarded = raw.min((config.daily_cap_points - used).max(0));
        if awarded > 0 {
            *daily.entry(key).or_insert(0) += awarded;
        }

        debug!(
            child = %session.child_id,
            app = session.app_id.as_deref().unwrap_or("-"),
            raw,
            awarded,
            "usage session ended"
        );
        (session, awarded)
    }

    /// Whether the scope still has daily cap headroom right now. The
    /// app-less scope is measured against the child's global daily total.
    pub async fn can_accrue(
        &self,
        child_id: &str,
        app_id: Option<&str>,
        config: &PointsConfig,
    ) -> bool {
        self.today_points(child_id, app_id).await < config.daily_cap_points
    }

    /// Points accrued today. With an app this is that scope's counter; with
    /// `None` it is the child's global total across every app plus app-less
    /// accrual, not just the app-less bucket.
    pub async fn today_points(&self, child_id: &str, app_id: Option<&str>) -> i64 {
        let today = day_key(Utc::now());
        let daily = self.daily.lock().await;
        match app_id {
            Some(app) => daily
                .iter()
                .filter(|(k, _)| {
                    k.child_id == child_id && k.app_id.as_deref() == Some(app) && k.day == today
                })
                .map(|(_, v)| v)
                .sum(),
            None => daily
                .iter()
                .filter(|(k, _)| k.child_id == child_id && k.day == today)
                .map(|(_, v)| v)
                .sum(),
        }
    }

    /// Drop every accrual counter for a child, across all scopes and days.
    pub async fn reset_daily(&self, child_id: &str) {
        let mut daily = self.daily.lock().await;
        daily.retain(|k, _| k.child_id != child_id);
        debug!(child = child_id, "daily accrual counters reset");
    }

    /// Seed a scope's counter for the day containing `at`. Used when the
    /// engine is rebuilt and today's awards must be replayed from the ledger
    /// so the daily cap keeps holding across restarts.
    pub async fn prime(
        &self,
        child_id: &str,
        app_id: Option<&str>,
        at: DateTime<Utc>,
        points: i64,
    ) {
        let key = AccrualKey {
            child_id: child_id.to_string(),
            app_id: app_id.map(str::to_string),
            day: day_key(at),
        };
        let mut daily = self.daily.lock().await;
        daily.insert(key, points.max(0));
    }
}
