//! Approval Service: one-shot, bounded-lifetime tokens authorizing side-effectful
//! workflow applies.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::sync::Mutex;

use crate::error::ApprovalError;

const TOKEN_BYTES: usize = 16; // 128 bits of entropy, per the data model invariant.
const GC_GRACE: chrono::Duration = chrono::Duration::seconds(30);

struct TokenEntry {
    subject: String,
    expires_at: DateTime<Utc>,
    consumed: bool,
}

/// In-memory token table behind a single mutex. Persistence is out of scope: on
/// restart all outstanding tokens are invalidated and callers must re-request.
pub struct ApprovalService {
    tokens: Mutex<HashMap<String, TokenEntry>>,
    default_ttl: Duration,
}

impl ApprovalService {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Issue a fresh token authorizing `subject`, valid for `ttl` (or the service
    /// default if `None`).
    pub async fn issue(&self, subject: impl Into<String>, ttl: Option<Duration>) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));

        let mut tokens = self.tokens.lock().await;
        tokens.insert(
            token.clone(),
            TokenEntry {
                subject: subject.into(),
                expires_at,
                consumed: false,
            },
        );
        token
    }

    /// Atomically check-and-consume a token. A concurrent second validation of the
    /// same token always returns `AlreadyConsumed`.
    pub async fn validate_and_consume(
        &self,
        token: &str,
        expected_subject: &str,
    ) -> Result<(), ApprovalError> {
        let mut tokens = self.tokens.lock().await;
        let entry = tokens.get_mut(token).ok_or(ApprovalError::Unknown)?;

        if entry.consumed {
            return Err(ApprovalError::AlreadyConsumed);
        }
        if Utc::now() >= entry.expires_at {
            return Err(ApprovalError::Expired);
        }
        if entry.subject != expected_subject {
            return Err(ApprovalError::SubjectMismatch);
        }

        entry.consumed = true;
        Ok(())
    }

    /// Remove entries that expired more than the grace period ago. Intended to be
    /// called on a periodic interval by a supervised background task.
    pub async fn gc(&self) {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;
        tokens.retain(|_, entry| now <= entry.expires_at + GC_GRACE);
    }

    /// Run `gc()` every `interval` until cancelled. Intended to be spawned as an
    /// independent supervised task.
    pub async fn run_gc_loop(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.gc().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issue_then_validate_succeeds_once() {
        let svc = ApprovalService::new(Duration::from_secs(60));
        let token = svc.issue("w1", None).await;
        assert!(svc.validate_and_consume(&token, "w1").await.is_ok());
        assert_eq!(
            svc.validate_and_consume(&token, "w1").await,
            Err(ApprovalError::AlreadyConsumed)
        );
    }

    #[tokio::test]
    async fn subject_mismatch_is_rejected() {
        let svc = ApprovalService::new(Duration::from_secs(60));
        let token = svc.issue("w1", None).await;
        assert_eq!(
            svc.validate_and_consume(&token, "w2").await,
            Err(ApprovalError::SubjectMismatch)
        );
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let svc = ApprovalService::new(Duration::from_secs(60));
        assert_eq!(
            svc.validate_and_consume("not-a-real-token", "w1").await,
            Err(ApprovalError::Unknown)
        );
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let svc = ApprovalService::new(Duration::from_millis(5));
        let token = svc.issue("w1", Some(Duration::from_millis(5))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            svc.validate_and_consume(&token, "w1").await,
            Err(ApprovalError::Expired)
        );
    }

    #[tokio::test]
    async fn gc_evicts_only_past_the_grace_window() {
        let svc = ApprovalService::new(Duration::from_millis(10));
        let token = svc.issue("w1", Some(Duration::from_millis(10))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        svc.gc().await;
        // Still within the 30s grace window, so still present (unknown != expired
        // would indicate premature eviction).
        assert_eq!(
            svc.validate_and_consume(&token, "w1").await,
            Err(ApprovalError::Expired)
        );
    }

    #[tokio::test]
    async fn concurrent_validation_only_one_winner() {
        let svc = std::sync::Arc::new(ApprovalService::new(Duration::from_secs(60)));
        let token = svc.issue("w1", None).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = svc.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                svc.validate_and_consume(&token, "w1").await
            }));
        }

        let mut ok_count = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok_count += 1;
            }
        }
        assert_eq!(ok_count, 1);
    }
}
