//! ==============================================================================
//! replay.rs - short-lived memory of accepted signatures
//! ==============================================================================
//!
//! purpose:
//!     a signature may pass the guard once per ttl. the ttl outlives the
//!     signature freshness window, so a captured upload is either stale or
//!     already remembered when it is replayed.
//!
//! concurrency:
//!     lookup and insert happen under one lock, so two concurrent calls with
//!     the same signature cannot both succeed. expired entries are dropped on
//!     lookup and by `sweep()`, which main.rs runs on an interval.
//!
//! the clock is tokio's, so tests drive expiry with a paused runtime.
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{IngestError, IngestResult};

pub struct ReplayGuard {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl ReplayGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// reject a signature seen within the ttl, otherwise remember it
    pub fn check_and_record(&self, signature: &str) -> IngestResult<()> {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(expires) = seen.get(signature) {
            if *expires > now {
                return Err(IngestError::ReplayDetected);
            }
        }
        seen.insert(signature.to_string(), now + self.ttl);
        Ok(())
    }

    /// drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = seen.len();
        seen.retain(|_, expires| *expires > now);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn second_use_within_ttl_is_rejected() {
        let guard = ReplayGuard::new(Duration::from_secs(120));
        assert!(guard.check_and_record("abc").is_ok());
        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(matches!(guard.check_and_record("abc"), Err(IngestError::ReplayDetected)));
    }

    #[tokio::test(start_paused = true)]
    async fn signature_is_accepted_again_after_expiry() {
        let guard = ReplayGuard::new(Duration::from_secs(120));
        guard.check_and_record("abc").unwrap();
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(guard.check_and_record("abc").is_ok());
        assert!(guard.check_and_record("abc").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_only_expired_entries() {
        let guard = ReplayGuard::new(Duration::from_secs(120));
        guard.check_and_record("old").unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        guard.check_and_record("new").unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(guard.sweep(), 1);
        assert_eq!(guard.len(), 1);
        assert!(guard.check_and_record("new").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_signature_passes_once() {
        let guard = Arc::new(ReplayGuard::new(Duration::from_secs(120)));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move { guard.check_and_record("shared").is_ok() }));
        }
        let mut passed = 0;
        for h in handles {
            if h.await.unwrap() {
                passed += 1;
            }
        }
        assert_eq!(passed, 1);
    }
}
