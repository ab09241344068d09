use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::rewards::config::PointsConfig;

/// One stretch of learning-app usage for a child.
///
/// The usage monitor creates a session when activity starts, touches it on
/// every activity ping, and finishes it exactly once. Sessions themselves are
/// never persisted; only the ledger entry derived at session end survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSession {
    pub child_id: String,
    /// App the usage happened in, when the monitor can attribute it.
    pub app_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl UsageSession {
    /// Start a new session. Start and last-activity coincide.
    pub fn start(child_id: impl Into<String>, app_id: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            child_id: child_id.into(),
            app_id,
            started_at: at,
            last_activity: at,
            ended_at: None,
        }
    }

    /// Record an activity ping. Activity never moves backwards, so a ping
    /// carrying a stale timestamp is ignored.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Seconds of usage that count as active: from session start up to its
    /// end, but never further than the idle-timeout slack past the last
    /// detected ping. Anything a skewed clock turns negative clamps to zero.
    pub fn active_seconds(&self, idle_timeout_seconds: i64) -> i64 {
        let idle_cutoff = self.last_activity + Duration::seconds(idle_timeout_seconds.max(0));
        let effective_end = match self.ended_at {
            Some(ended) => ended.min(idle_cutoff),
            None => idle_cutoff,
        };
        (effective_end - self.started_at).num_seconds().max(0)
    }
}

/// Points a session is worth before the daily cap: fractional active minutes
/// times the configured rate, floored. Never negative, even for sessions
/// whose timestamps arrived out of order.
pub fn calculate_points(session: &UsageSession, config: &PointsConfig) -> i64 {
    let active = session.active_seconds(config.idle_timeout_seconds);
    active * config.points_per_minute.max(0) / 60
}
