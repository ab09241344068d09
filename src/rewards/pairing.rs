use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::rewards::config::PairingLimits;
use crate::rewards::storage;

/// Current pairings document version
const PAIRINGS_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("pairing code has expired")]
    CodeExpired,

    #[error("pairing code was already used")]
    CodeAlreadyUsed,

    #[error("too many pairing codes requested, try again later")]
    RateLimitExceeded,

    #[error("unknown pairing code")]
    CodeNotFound,

    #[error("no pairing exists for device {0}")]
    PairingNotFound(String),
}

/// A short-lived numeric token a parent device shows and a child device
/// enters. Only the most recently generated code per child is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub child_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// The durable result of consuming a code: this device now belongs to this
/// child, until the pairing is explicitly revoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildDevicePairing {
    pub child_id: String,
    pub device_id: String,
    pub paired_at: DateTime<Utc>,
}

/// On-disk shape of the pairings. Codes are TTL'd ephemera and stay in
/// memory.
#[derive(Debug, Serialize, Deserialize)]
struct PairingsDocument {
    version: String,
    pairings: HashMap<String, ChildDevicePairing>,
}

#[derive(Default)]
struct PairingInner {
    /// Latest code per child; superseded codes simply disappear.
    active_codes: HashMap<String, PairingCode>,
    /// code -> device that consumed it. A consumed code never works again.
    consumed_codes: HashMap<String, String>,
    /// device -> pairing
    pairings: HashMap<String, ChildDevicePairing>,
    /// Recent generation times per child, pruned to the rolling window.
    recent_generations: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Issues rate-limited, TTL'd pairing codes and consumes them into
/// device-child bindings.
#[derive(Clone)]
pub struct PairingService {
    limits: PairingLimits,
    inner: Arc<Mutex<PairingInner>>,
}

impl PairingService {
    pub fn new(limits: PairingLimits) -> Self {
        Self {
            limits,
            inner: Arc::new(Mutex::new(PairingInner::default())),
        }
    }

    /// Generate a fresh 6-digit code for a child, superseding any prior
    /// active code. Generation is limited to a rolling window per child.
    pub async fn generate_pairing_code(
        &self,
        child_id: &str,
        ttl_minutes: i64,
    ) -> Result<PairingCode, PairingError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let window = Duration::minutes(self.limits.window_minutes);
        let history = inner
            .recent_generations
            .entry(child_id.to_string())
            .or_default();
        history.retain(|t| now - *t < window);
        if history.len() >= self.limits.max_codes_per_window {
            warn!(child = child_id, "pairing code rate limit hit");
            return Err(PairingError::RateLimitExceeded);
        }
        history.push(now);

        // Redraw on the off chance the code collides with one still in play.
        let code = loop {
            let candidate = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
            let taken = inner.consumed_codes.contains_key(&candidate)
                || inner.active_codes.values().any(|c| c.code == candidate);
            if !taken {
                break candidate;
            }
        };

        let pairing_code = PairingCode {
            code,
            child_id: child_id.to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(ttl_minutes.max(0)),
        };
        info!(child = child_id, ttl_minutes, "pairing code generated");
        inner
            .active_codes
            .insert(child_id.to_string(), pairing_code.clone());
        Ok(pairing_code)
    }

    /// The child's current code, if one was generated and not yet consumed.
    pub async fn active_code(&self, child_id: &str) -> Option<PairingCode> {
        let inner = self.inner.lock().await;
        inner.active_codes.get(child_id).cloned()
    }

    /// Consume a code on a device, producing exactly one pairing record and
    /// clearing the active-code association. A consumed code stays consumed
    /// for every device, including the one that used it.
    pub async fn consume_pairing_code(
        &self,
        code: &str,
        device_id: &str,
    ) -> Result<ChildDevicePairing, PairingError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if inner.consumed_codes.contains_key(code) {
            return Err(PairingError::CodeAlreadyUsed);
        }

        let child_id = inner
            .active_codes
            .iter()
            .find(|(_, c)| c.code == code)
            .map(|(child, _)| child.clone())
            .ok_or(PairingError::CodeNotFound)?;

        let active = &inner.active_codes[&child_id];
        if now > active.expires_at {
            return Err(PairingError::CodeExpired);
        }

        let pairing = ChildDevicePairing {
            child_id: child_id.clone(),
            device_id: device_id.to_string(),
            paired_at: now,
        };
        inner.active_codes.remove(&child_id);
        inner
            .consumed_codes
            .insert(code.to_string(), device_id.to_string());
        inner
            .pairings
            .insert(device_id.to_string(), pairing.clone());
        info!(child = %child_id, device = device_id, "device paired");
        Ok(pairing)
    }

    /// Look up the pairing for a device.
    pub async fn get_pairing(&self, device_id: &str) -> Option<ChildDevicePairing> {
        let inner = self.inner.lock().await;
        inner.pairings.get(device_id).cloned()
    }

    /// Remove a device's pairing. Fails when none exists.
    pub async fn revoke_pairing(
        &self,
        device_id: &str,
    ) -> Result<ChildDevicePairing, PairingError> {
        let mut inner = self.inner.lock().await;
        let pairing = inner
            .pairings
            .remove(device_id)
            .ok_or_else(|| PairingError::PairingNotFound(device_id.to_string()))?;
        info!(child = %pairing.child_id, device = device_id, "pairing revoked");
        Ok(pairing)
    }

    /// Persist the pairing records. Codes and rate-limit history are
    /// deliberately not saved; they expire too quickly to matter across a
    /// restart.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let document = {
            let inner = self.inner.lock().await;
            PairingsDocument {
                version: PAIRINGS_VERSION.to_string(),
                pairings: inner.pairings.clone(),
            }
        };

        let content =
            serde_json::to_string_pretty(&document).context("Failed to serialize pairings")?;
        storage::atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write pairings file: {}", path.display()))?;
        Ok(())
    }

    /// Replace in-memory pairings with the persisted set. Parsed fully
    /// before any state changes.
    pub async fn load(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pairings file: {}", path.display()))?;
        let document: PairingsDocument = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pairings file: {}", path.display()))?;

        if document.version != PAIRINGS_VERSION {
            anyhow::bail!(
                "Pairings file version mismatch (expected {}, got {}): {}",
                PAIRINGS_VERSION,
                document.version,
                path.display()
            );
        }

        let mut inner = self.inner.lock().await;
        inner.pairings = document.pairings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize, window_minutes: i64) -> PairingLimits {
        PairingLimits {
            max_codes_per_window: max,
            window_minutes,
        }
    }

    #[tokio::test]
    async fn test_generated_code_is_six_digits() {
        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 10).await.unwrap();
        assert_eq!(code.code.len(), 6);
        assert!(code.code.chars().all(|c| c.is_ascii_digit()));
        assert!(code.expires_at > code.created_at);
    }

    #[tokio::test]
    async fn test_sixth_generation_hits_rate_limit() {
        let service = PairingService::new(limits(5, 60));
        for _ in 0..5 {
            service.generate_pairing_code("kid1", 10).await.unwrap();
        }
        let err = service.generate_pairing_code("kid1", 10).await.unwrap_err();
        assert_eq!(err, PairingError::RateLimitExceeded);

        // Other children are unaffected.
        assert!(service.generate_pairing_code("kid2", 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_newer_code_supersedes_older() {
        let service = PairingService::new(limits(5, 60));
        let first = service.generate_pairing_code("kid1", 10).await.unwrap();
        let second = service.generate_pairing_code("kid1", 10).await.unwrap();

        let active = service.active_code("kid1").await.unwrap();
        assert_eq!(active.code, second.code);

        // The superseded code no longer exists anywhere.
        let err = service
            .consume_pairing_code(&first.code, "tablet-1")
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::CodeNotFound);
    }

    #[tokio::test]
    async fn test_consume_creates_pairing_and_clears_code() {
        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 10).await.unwrap();

        let pairing = service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap();
        assert_eq!(pairing.child_id, "kid1");
        assert_eq!(pairing.device_id, "tablet-1");

        assert!(service.active_code("kid1").await.is_none());
        assert!(service.get_pairing("tablet-1").await.is_some());
    }

    #[tokio::test]
    async fn test_consumed_code_rejects_every_device() {
        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 10).await.unwrap();
        service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap();

        // A different device, and the same device again, both fail.
        let err = service
            .consume_pairing_code(&code.code, "tablet-2")
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::CodeAlreadyUsed);

        let err = service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::CodeAlreadyUsed);
    }

    #[tokio::test]
    async fn test_zero_ttl_code_expires() {
        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 0).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::CodeExpired);
    }

    #[tokio::test]
    async fn test_unknown_code_not_found() {
        let service = PairingService::new(limits(5, 60));
        let err = service
            .consume_pairing_code("000000", "tablet-1")
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::CodeNotFound);
    }

    #[tokio::test]
    async fn test_revoke_pairing() {
        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 10).await.unwrap();
        service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap();

        let revoked = service.revoke_pairing("tablet-1").await.unwrap();
        assert_eq!(revoked.child_id, "kid1");
        assert!(service.get_pairing("tablet-1").await.is_none());

        let err = service.revoke_pairing("tablet-1").await.unwrap_err();
        assert_eq!(err, PairingError::PairingNotFound("tablet-1".to_string()));
    }

    #[tokio::test]
    async fn test_pairings_survive_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairings.json");

        let service = PairingService::new(limits(5, 60));
        let code = service.generate_pairing_code("kid1", 10).await.unwrap();
        service
            .consume_pairing_code(&code.code, "tablet-1")
            .await
            .unwrap();
        service.save(&path).await.unwrap();

        let restored = PairingService::new(limits(5, 60));
        restored.load(&path).await.unwrap();
        let pairing = restored.get_pairing("tablet-1").await.unwrap();
        assert_eq!(pairing.child_id, "kid1");
    }
}
