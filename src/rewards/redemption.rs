use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::rewards::config::RedemptionConfig;
use crate::rewards::exemption::EarnedTimeWindow;
use crate::rewards::ledger::PointsLedger;

/// Why a redemption request was refused. All variants are pure validation
/// failures: the ledger is never touched before one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    #[error("insufficient balance: requested {requested} points, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("redemption must be at least {min} points")]
    BelowMinimum { min: i64 },

    #[error("redemption may not exceed {max} points")]
    AboveMaximum { max: i64 },

    #[error("unknown child: {0}")]
    ChildNotFound(String),
}

/// Converts points into earned reward time by debiting the ledger.
#[derive(Clone)]
pub struct RedemptionService {
    ledger: PointsLedger,
}

impl RedemptionService {
    pub fn new(ledger: PointsLedger) -> Self {
        Self { ledger }
    }

    /// Check whether a redemption would be allowed, returning the current
    /// balance on success. Rules are checked in a fixed order (balance,
    /// minimum, maximum) so callers always see the first violated one.
    pub async fn can_redeem(
        &self,
        child_id: &str,
        points: i64,
        config: &RedemptionConfig,
        app_id: Option<&str>,
    ) -> Result<i64, RedemptionError> {
        let available = self.ledger.balance(child_id, app_id).await;
        if points > available {
            return Err(RedemptionError::InsufficientBalance {
                requested: points,
                available,
            });
        }
        if points < config.min_redemption_points {
            return Err(RedemptionError::BelowMinimum {
                min: config.min_redemption_points,
            });
        }
        if points > config.max_redemption_points {
            return Err(RedemptionError::AboveMaximum {
                max: config.max_redemption_points,
            });
        }
        Ok(available)
    }

    /// Execute a redemption: validate, debit the ledger, and produce the
    /// window the shield collaborator should honor. A validation failure
    /// leaves the ledger untouched.
    pub async fn redeem(
        &self,
        child_id: &str,
        points: i64,
        config: &RedemptionConfig,
        app_id: Option<&str>,
    ) -> Result<EarnedTimeWindow, RedemptionError> {
        self.can_redeem(child_id, points, config, app_id).await?;

        self.ledger
            .record_redemption(child_id, app_id.map(str::to_string), points, None)
            .await;

        let duration_seconds = points * 60 / config.points_per_minute.max(1);
        let window = EarnedTimeWindow::open(child_id, duration_seconds, Utc::now());
        info!(
            child = child_id,
            points,
            duration = duration_seconds,
            "points redeemed for reward time"
        );
        Ok(window)
    }
}

/// Reward minutes a point amount buys. Fractional minutes are allowed.
pub fn calculate_minutes(points: i64, config: &RedemptionConfig) -> f64 {
    points as f64 / config.points_per_minute.max(1) as f64
}

/// Points needed for a whole number of reward minutes.
pub fn calculate_points_needed(minutes: i64, config: &RedemptionConfig) -> i64 {
    minutes * config.points_per_minute
}
