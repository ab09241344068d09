/// Rewards module: the earn-and-spend accounting core
///
/// This module provides functionality to:
/// - Convert learning-app usage sessions into points (idle-aware, daily-capped)
/// - Keep an append-only per-child points ledger with balance queries
/// - Redeem points for time-boxed reward-app windows
/// - Manage active exemption windows with cancelable expiry timers
/// - Issue and consume pairing codes binding a child to a device

pub mod accrual;
pub mod config;
pub mod exemption;
pub mod ledger;
pub mod pairing;
pub mod redemption;
pub mod session;
pub mod storage;

pub use accrual::AccrualEngine;
pub use config::{PointsConfig, RedemptionConfig, RewardsConfig};
pub use exemption::{EarnedTimeWindow, ExemptionManager, ExemptionPolicy};
pub use ledger::{AuditEntry, EntryKind, LedgerEntry, PointsLedger};
pub use pairing::{ChildDevicePairing, PairingCode, PairingError, PairingService};
pub use redemption::{RedemptionError, RedemptionService};
pub use session::UsageSession;
