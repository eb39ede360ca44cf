//! Credential pool and per-page retry bookkeeping for narration.
//!
//! Everything here is pure state: no I/O, no sleeping. The generator in
//! [`crate::pipeline::narrate`] drives the state machine and does the
//! waiting, which keeps the rotation and backoff rules unit-testable.

use crate::error::{GenerationError, NarrationError};
use crate::pipeline::llm::NarrationBackend;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One narration credential: a label for logs and the backend bound to it.
///
/// The label is what appears in logs and errors; the secret itself stays
/// inside the backend.
#[derive(Clone)]
pub struct Credential {
    label: String,
    backend: Arc<dyn NarrationBackend>,
}

impl Credential {
    pub fn new(label: impl Into<String>, backend: Arc<dyn NarrationBackend>) -> Self {
        Self {
            label: label.into(),
            backend,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> &Arc<dyn NarrationBackend> {
        &self.backend
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Mask an API key for display: `AIza…wXyz`.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Round-robin cursor over `len` credentials with a per-credential cooldown.
///
/// A credential that just returned a rate limit is marked exhausted for
/// `cooldown`. Rotation skips exhausted credentials unless every credential
/// is cooling down, in which case it simply moves to the next one.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    cursor: usize,
    cooldown: Duration,
    exhausted_until: Vec<Option<Instant>>,
}

impl CredentialPool {
    pub fn new(len: usize, cooldown: Duration) -> Result<Self, NarrationError> {
        if len == 0 {
            return Err(NarrationError::NoCredentials);
        }
        Ok(Self {
            cursor: 0,
            cooldown,
            exhausted_until: vec![None; len],
        })
    }

    pub fn len(&self) -> usize {
        self.exhausted_until.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exhausted_until.is_empty()
    }

    /// Index of the credential the next call should use.
    pub fn current(&self) -> usize {
        self.cursor
    }

    /// Plain round-robin step, used when rotating after every page.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.len();
    }

    /// Mark the current credential exhausted and move to the next usable one.
    ///
    /// Returns the new cursor.
    pub fn rotate_after_rate_limit(&mut self, now: Instant) -> usize {
        let len = self.len();
        self.exhausted_until[self.cursor] = Some(now + self.cooldown);

        for step in 1..=len {
            let candidate = (self.cursor + step) % len;
            if !self.is_cooling(candidate, now) {
                self.cursor = candidate;
                return self.cursor;
            }
        }
        // Everything is cooling down; keep cycling anyway.
        self.cursor = (self.cursor + 1) % len;
        self.cursor
    }

    pub fn is_cooling(&self, index: usize, now: Instant) -> bool {
        matches!(self.exhausted_until.get(index), Some(Some(until)) if *until > now)
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────────

/// Exponential backoff for rate-limited narration calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rate-limited attempts allowed per page before it fails.
    pub max_retries: u32,
    pub base: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt that follows the `retry`-th rate limit
    /// (0-based): `base * 2^retry`, capped at `max_backoff`.
    ///
    /// The cap departs from a plain `2^retry` schedule: without it the
    /// 20th retry alone would wait about 12 days at a 1 s base.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// ── Page state machine ───────────────────────────────────────────────────────

/// Lifecycle of one page's narration.
///
/// ```text
/// Pending ─▶ Calling ──ok──────────▶ Done
///               │ ▲
///   rate limit  │ │ after delay
///               ▼ │
///             Backoff ──cap reached─▶ Failed
/// Calling ──fatal──────────────────▶ Failed
/// ```
#[derive(Debug)]
pub enum PageState {
    Pending,
    Calling { retries: u32 },
    Backoff { retries: u32, delay: Duration },
    Done { text: String, retries: u32 },
    Failed(NarrationError),
}

impl PageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Done { .. } | PageState::Failed(_))
    }

    /// Start (or resume after a backoff).
    pub fn start(self) -> PageState {
        match self {
            PageState::Pending => PageState::Calling { retries: 0 },
            PageState::Backoff { retries, .. } => PageState::Calling { retries },
            other => other,
        }
    }

    /// Apply the outcome of a call made in the `Calling` state.
    pub fn on_result(
        self,
        page: usize,
        credential: &str,
        result: Result<String, GenerationError>,
        policy: &RetryPolicy,
    ) -> PageState {
        let retries = match self {
            PageState::Calling { retries } => retries,
            other => return other,
        };
        match result {
            Ok(text) => PageState::Done { text, retries },
            Err(GenerationError::RateLimited(detail)) => {
                let counted = retries + 1;
                if counted >= policy.max_retries {
                    PageState::Failed(NarrationError::RetriesExhausted {
                        page,
                        retries: counted,
                        last_error: detail,
                    })
                } else {
                    PageState::Backoff {
                        retries: counted,
                        delay: policy.delay(retries),
                    }
                }
            }
            Err(GenerationError::Fatal(detail)) => PageState::Failed(NarrationError::Generation {
                page,
                credential: credential.to_string(),
                detail,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        }
    }

    #[test]
    fn empty_pool_rejected() {
        let err = CredentialPool::new(0, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(err, NarrationError::NoCredentials));
    }

    #[test]
    fn advance_wraps() {
        let mut pool = CredentialPool::new(3, Duration::from_secs(60)).unwrap();
        pool.advance();
        pool.advance();
        assert_eq!(pool.current(), 2);
        pool.advance();
        assert_eq!(pool.current(), 0);
    }

    #[test]
    fn rotation_skips_cooling_credentials() {
        let now = Instant::now();
        let mut pool = CredentialPool::new(3, Duration::from_secs(60)).unwrap();
        // 0 → 1, then 1 → 2
        assert_eq!(pool.rotate_after_rate_limit(now), 1);
        assert_eq!(pool.rotate_after_rate_limit(now), 2);
        // 0 and 1 are cooling, 2 just failed: everything is cooling, move on.
        assert_eq!(pool.rotate_after_rate_limit(now), 0);
        assert!(pool.is_cooling(1, now));
    }

    #[test]
    fn cooldown_expires() {
        let now = Instant::now();
        let mut pool = CredentialPool::new(2, Duration::from_secs(60)).unwrap();
        pool.rotate_after_rate_limit(now);
        assert!(pool.is_cooling(0, now));
        assert!(!pool.is_cooling(0, now + Duration::from_secs(61)));
    }

    #[test]
    fn single_credential_stays_put() {
        let now = Instant::now();
        let mut pool = CredentialPool::new(1, Duration::from_secs(60)).unwrap();
        assert_eq!(pool.rotate_after_rate_limit(now), 0);
    }

    #[test]
    fn total_wait_is_geometric_until_cap() {
        let p = RetryPolicy {
            max_retries: 100,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(600),
        };
        // 1 + 2 + … + 512 = 1023 s before the cap applies.
        let uncapped: Duration = (0..10).map(|r| p.delay(r)).sum();
        assert_eq!(uncapped, Duration::from_secs(1023));
        assert_eq!(p.delay(9), Duration::from_secs(512));
        assert_eq!(p.delay(10), Duration::from_secs(600));
        // Every later retry waits exactly the cap.
        let capped: Duration = (0..15).map(|r| p.delay(r)).sum();
        assert_eq!(capped, Duration::from_secs(1023 + 5 * 600));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 100,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        assert_eq!(p.delay(0), Duration::from_secs(1));
        assert_eq!(p.delay(1), Duration::from_secs(2));
        assert_eq!(p.delay(3), Duration::from_secs(8));
        assert_eq!(p.delay(4), Duration::from_secs(10));
        assert_eq!(p.delay(99), Duration::from_secs(10));
    }

    #[test]
    fn state_success_after_rate_limits() {
        let p = policy(5);
        let mut state = PageState::Pending.start();
        state = state.on_result(0, "k1", Err(GenerationError::RateLimited("429".into())), &p);
        assert!(matches!(
            state,
            PageState::Backoff { retries: 1, delay } if delay == Duration::from_secs(1)
        ));
        state = state.start();
        state = state.on_result(0, "k2", Err(GenerationError::RateLimited("429".into())), &p);
        assert!(matches!(
            state,
            PageState::Backoff { retries: 2, delay } if delay == Duration::from_secs(2)
        ));
        state = state.start().on_result(0, "k1", Ok("hello".into()), &p);
        match state {
            PageState::Done { text, retries } => {
                assert_eq!(text, "hello");
                assert_eq!(retries, 2);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn state_fails_at_cap() {
        let p = policy(2);
        let state = PageState::Pending
            .start()
            .on_result(3, "k", Err(GenerationError::RateLimited("429".into())), &p)
            .start()
            .on_result(3, "k", Err(GenerationError::RateLimited("still 429".into())), &p);
        match state {
            PageState::Failed(NarrationError::RetriesExhausted {
                page,
                retries,
                last_error,
            }) => {
                assert_eq!(page, 3);
                assert_eq!(retries, 2);
                assert_eq!(last_error, "still 429");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn state_fatal_is_not_retried() {
        let state = PageState::Pending.start().on_result(
            1,
            "key-b",
            Err(GenerationError::Fatal("HTTP 400".into())),
            &policy(100),
        );
        assert!(state.is_terminal());
        assert!(matches!(
            state,
            PageState::Failed(NarrationError::Generation { ref credential, .. }) if credential == "key-b"
        ));
    }

    #[test]
    fn mask_key_hides_middle() {
        assert_eq!(mask_key("AIzaSyABCDEFGHwXyz"), "AIza…wXyz");
        assert_eq!(mask_key("short"), "****");
    }
}
