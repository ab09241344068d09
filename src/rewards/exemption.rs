use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rewards::storage;

/// Current windows document version
const WINDOWS_VERSION: &str = "1.0";

/// A time-boxed grant of reward-app access, produced by a redemption and
/// consumed by the shield collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarnedTimeWindow {
    pub id: Uuid,
    pub child_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl EarnedTimeWindow {
    pub fn open(child_id: impl Into<String>, duration_seconds: i64, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            child_id: child_id.into(),
            started_at: at,
            duration_seconds: duration_seconds.max(0),
        }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(self.duration_seconds)
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.end_time() - Utc::now()).num_seconds().max(0)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.end_time()
    }

    fn remaining(&self) -> std::time::Duration {
        let millis = (self.end_time() - Utc::now()).num_milliseconds().max(0);
        std::time::Duration::from_millis(millis as u64)
    }
}

/// Whether a new window may start while one is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExemptionPolicy {
    /// Refuse the new window until the active one ends
    #[default]
    Block,
    /// Admit; the new window replaces the active one
    Replace,
    /// Admit; callers typically extend rather than replace
    Extend,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("an exemption window is already active for child {child_id}")]
pub struct ExemptionBlocked {
    pub child_id: String,
}

/// Invoked when a window's timer fires. Never invoked for canceled windows.
pub type ExpiryHandler = Arc<dyn Fn(EarnedTimeWindow) + Send + Sync>;

struct ActiveExemption {
    window: EarnedTimeWindow,
    generation: u64,
    timer: JoinHandle<()>,
    on_expiry: Option<ExpiryHandler>,
}

#[derive(Default)]
struct ManagerInner {
    active: HashMap<String, ActiveExemption>,
    next_generation: u64,
}

/// On-disk shape of the active windows.
#[derive(Debug, Serialize, Deserialize)]
struct WindowsDocument {
    version: String,
    windows: HashMap<String, EarnedTimeWindow>,
}

/// Owns the active earned-time windows and their expiry timers, one window
/// per child at most.
///
/// Every timer is tagged with a generation number and may only consume the
/// window whose generation still matches, checked under the state mutex.
/// Cancel and replace bump the generation and abort the old task first, so a
/// cancellation racing a concurrent fire can never deliver a stale callback.
#[derive(Clone)]
pub struct ExemptionManager {
    policy: ExemptionPolicy,
    default_handler: Option<ExpiryHandler>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl ExemptionManager {
    pub fn new(policy: ExemptionPolicy) -> Self {
        Self {
            policy,
            default_handler: None,
            inner: Arc::new(Mutex::new(ManagerInner::default())),
        }
    }

    /// Like `new`, with a handler applied to windows that expire without a
    /// per-window callback (restored windows in particular).
    pub fn with_default_handler(policy: ExemptionPolicy, handler: ExpiryHandler) -> Self {
        Self {
            policy,
            default_handler: Some(handler),
            inner: Arc::new(Mutex::new(ManagerInner::default())),
        }
    }

    /// Whether a new window would currently be admitted for this child.
    /// Only the `block` policy with a live window refuses.
    pub async fn can_start_exemption(&self, child_id: &str) -> bool {
        if self.policy != ExemptionPolicy::Block {
            return true;
        }
        let guard = self.inner.lock().await;
        !guard
            .active
            .get(child_id)
            .is_some_and(|a| !a.window.is_expired())
    }

    /// Start a window and arm its expiry timer. Under a non-blocking policy
    /// an active window is canceled (its callback is not invoked) and
    /// replaced by the new one.
    pub async fn start_exemption(
        &self,
        window: EarnedTimeWindow,
        on_expiry: Option<ExpiryHandler>,
    ) -> Result<(), ExemptionBlocked> {
        let child_id = window.child_id.clone();
        let mut guard = self.inner.lock().await;

        let live = guard
            .active
            .get(&child_id)
            .is_some_and(|a| !a.window.is_expired());
        if live && self.policy == ExemptionPolicy::Block {
            return Err(ExemptionBlocked { child_id });
        }

        if let Some(previous) = guard.active.remove(&child_id) {
            previous.timer.abort();
            debug!(child = %child_id, "previous exemption window replaced");
        }

        let generation = guard.next_generation;
        guard.next_generation += 1;

        let timer = self.arm_timer(child_id.clone(), generation, window.remaining());
        info!(
            child = %child_id,
            duration = window.duration_seconds,
            "exemption window started"
        );
        guard.active.insert(
            child_id,
            ActiveExemption {
                window,
                generation,
                timer,
                on_expiry,
            },
        );
        Ok(())
    }

    /// The child's current window, or `None` when there is none or the
    /// wall clock has already passed its end, even if the timer has not
    /// fired yet. Query-time expiry always agrees with timer-driven expiry.
    pub async fn get_active_window(&self, child_id: &str) -> Option<EarnedTimeWindow> {
        let guard = self.inner.lock().await;
        guard
            .active
            .get(child_id)
            .filter(|a| !a.window.is_expired())
            .map(|a| a.window.clone())
    }

    /// Every currently live window, for status displays.
    pub async fn active_windows(&self) -> Vec<EarnedTimeWindow> {
        let guard = self.inner.lock().await;
        guard
            .active
            .values()
            .filter(|a| !a.window.is_expired())
            .map(|a| a.window.clone())
            .collect()
    }

    /// Lengthen the child's active window, capped at `max_total_minutes`
    /// total, and reschedule its timer. Returns the updated window, or
    /// `None` when no live window exists.
    pub async fn extend_exemption(
        &self,
        child_id: &str,
        additional_seconds: i64,
        max_total_minutes: i64,
    ) -> Option<EarnedTimeWindow> {
        let mut guard = self.inner.lock().await;

        let live = guard
            .active
            .get(child_id)
            .is_some_and(|a| !a.window.is_expired());
        if !live {
            return None;
        }

        let mut entry = guard.active.remove(child_id).expect("checked above");
        entry.timer.abort();

        entry.window.duration_seconds = (entry.window.duration_seconds + additional_seconds)
            .min(max_total_minutes * 60)
            .max(0);

        let generation = guard.next_generation;
        guard.next_generation += 1;
        entry.generation = generation;

        let timer = self.arm_timer(child_id.to_string(), generation, entry.window.remaining());
        let updated = entry.window.clone();
        info!(
            child = child_id,
            duration = updated.duration_seconds,
            "exemption window extended"
        );
        guard.active.insert(
            child_id.to_string(),
            ActiveExemption { timer, ..entry },
        );
        Some(updated)
    }

    /// Cancel the child's window and its timer. The expiry callback is not
    /// invoked. Returns the canceled window, if any.
    pub async fn cancel_exemption(&self, child_id: &str) -> Option<EarnedTimeWindow> {
        let mut guard = self.inner.lock().await;
        let entry = guard.active.remove(child_id)?;
        entry.timer.abort();
        info!(child = child_id, "exemption window canceled");
        Some(entry.window)
    }

    /// Persist the live windows as a child-keyed map.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let document = {
            let guard = self.inner.lock().await;
            WindowsDocument {
                version: WINDOWS_VERSION.to_string(),
                windows: guard
                    .active
                    .iter()
                    .filter(|(_, a)| !a.window.is_expired())
                    .map(|(child, a)| (child.clone(), a.window.clone()))
                    .collect(),
            }
        };

        let content = serde_json::to_string_pretty(&document)
            .context("Failed to serialize exemption windows")?;
        storage::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write windows file: {}", path.display()))?;
        Ok(())
    }

    /// Replace current state with the persisted windows. Windows whose end
    /// time has already passed are dropped without a callback; the rest get
    /// fresh timers against the manager's default handler. The document is
    /// fully parsed before any state changes, so a failed load leaves the
    /// manager untouched.
    pub async fn restore_from_persistence(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read windows file: {}", path.display()))?;
        let document: WindowsDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse windows file: {}", path.display()))?;

        if document.version != WINDOWS_VERSION {
            anyhow::bail!(
                "Windows file version mismatch (expected {}, got {}): {}",
                WINDOWS_VERSION,
                document.version,
                path.display()
            );
        }

        let mut guard = self.inner.lock().await;
        for (_, entry) in guard.active.drain() {
            entry.timer.abort();
        }

        for (child_id, window) in document.windows {
            if window.is_expired() {
                debug!(child = %child_id, "dropping expired window on restore");
                continue;
            }
            let generation = guard.next_generation;
            guard.next_generation += 1;
            let timer = self.arm_timer(child_id.clone(), generation, window.remaining());
            guard.active.insert(
                child_id,
                ActiveExemption {
                    window,
                    generation,
                    timer,
                    on_expiry: None,
                },
            );
        }
        Ok(())
    }

    /// Spawn the expiry task for one window generation. On firing it may
    /// only consume the entry whose generation still matches; anything else
    /// means the window was canceled or replaced while it slept.
    fn arm_timer(
        &self,
        child_id: String,
        generation: u64,
        fire_in: std::time::Duration,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let default_handler = self.default_handler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(fire_in).await;

            let expired = {
                let mut guard = inner.lock().await;
                let matches = guard
                    .active
                    .get(&child_id)
                    .is_some_and(|a| a.generation == generation);
                if matches {
                    guard.active.remove(&child_id)
                } else {
                    None
                }
            };

            if let Some(entry) = expired {
                debug!(child = %child_id, "exemption window expired");
                if let Some(handler) = entry.on_expiry.or(default_handler) {
                    handler(entry.window);
                }
            }
        })
    }
}
