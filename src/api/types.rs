//! Shared types for the HTTP layer: request context, caller identity,
//! admin rate limiter and run-bound stream tokens.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core_state::CoreState;
use crate::privacy::sha256_12;

// ═══════════════════════════════════════════════════════════
// API context — shared state for the router
// ═══════════════════════════════════════════════════════════

/// Shared context for all routes and middleware.
/// Wraps `CoreState` plus the mutable security state.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub stream_tokens: Arc<Mutex<StreamTokenStore>>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        let security = &core.config().security;
        let rate_limiter = RateLimiter::new(
            security.admin_rate_limit_max,
            security.admin_rate_limit_window,
        );
        let stream_tokens = StreamTokenStore::new(security.stream_token_ttl);
        Self {
            core,
            rate_limiter: Arc::new(Mutex::new(rate_limiter)),
            stream_tokens: Arc::new(Mutex::new(stream_tokens)),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Caller identity — injected by the auth middleware
// ═══════════════════════════════════════════════════════════

/// Resolved caller. A key is only ever represented by its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Key { fingerprint: String },
    Loopback,
}

impl Caller {
    pub fn from_key(key: &str) -> Self {
        Caller::Key {
            fingerprint: key_fingerprint(key),
        }
    }

    /// Stable identity string used for rate limiting and audit rows.
    pub fn as_str(&self) -> &str {
        match self {
            Caller::Key { fingerprint } => fingerprint,
            Caller::Loopback => "loopback",
        }
    }
}

/// `key:<first 12 hex chars of SHA-256>`.
pub fn key_fingerprint(key: &str) -> String {
    format!("key:{}", sha256_12(key.as_bytes()))
}

/// Random bearer-style token (URL-safe base64, 32 bytes of entropy).
pub fn generate_token() -> String {
    use base64::Engine;
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ═══════════════════════════════════════════════════════════
// Rate limiter — per-identity sliding window
// ═══════════════════════════════════════════════════════════

/// Sliding-window limiter: at most `max` admitted requests per identity
/// within any `window`. Rejected requests are not counted.
pub struct RateLimiter {
    windows: HashMap<String, VecDeque<Instant>>,
    max: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            windows: HashMap::new(),
            max: max.max(1),
            window,
        }
    }

    /// Admit one request now, or `Err(retry_after_secs)`.
    pub fn check(&mut self, identity: &str) -> Result<(), u64> {
        self.check_at(identity, Instant::now())
    }

    fn check_at(&mut self, identity: &str, now: Instant) -> Result<(), u64> {
        let window = self.window;
        let entries = self.windows.entry(identity.to_string()).or_default();
        while entries
            .front()
            .is_some_and(|ts| now.duration_since(*ts) >= window)
        {
            entries.pop_front();
        }

        if entries.len() as u32 >= self.max {
            let oldest = entries.front().copied().unwrap_or(now);
            let remaining = window.saturating_sub(now.duration_since(oldest));
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(secs.max(1));
        }

        entries.push_back(now);
        if self.windows.len() > 1024 {
            self.windows.retain(|_, e| {
                e.back().is_some_and(|ts| now.duration_since(*ts) < window)
            });
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════
// Stream tokens — one-time, run-bound SSE credentials
// ═══════════════════════════════════════════════════════════

struct StreamToken {
    run_id: String,
    /// Identity of the caller that requested the token.
    issued_to: String,
    expires_at: Instant,
}

/// One-time tokens that let an event stream authenticate without putting
/// the API key in a URL.
pub struct StreamTokenStore {
    tokens: HashMap<String, StreamToken>,
    ttl: Duration,
}

impl StreamTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token bound to `run_id` and the requesting caller.
    pub fn issue(&mut self, run_id: &str, caller: &Caller) -> String {
        self.cleanup();
        let token = generate_token();
        self.tokens.insert(
            token.clone(),
            StreamToken {
                run_id: run_id.to_string(),
                issued_to: caller.as_str().to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        tracing::debug!(run_id = %run_id, caller = caller.as_str(), "Token issued");
        token
    }

    /// Consume a token. Valid only once, before expiry, for the run it
    /// was issued for; any presented token is removed. Returns the
    /// identity the token was issued to.
    pub fn consume(&mut self, token: &str, run_id: &str) -> Option<String> {
        let entry = self.tokens.remove(token)?;
        (Instant::now() < entry.expires_at && entry.run_id == run_id).then_some(entry.issued_to)
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.tokens.retain(|_, t| now < t.expires_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hides_key() {
        let fp = key_fingerprint("super-secret");
        assert!(fp.starts_with("key:"));
        assert_eq!(fp.len(), 4 + 12);
        assert!(!fp.contains("secret"));
        assert_eq!(Caller::from_key("super-secret").as_str(), fp);
        assert_eq!(Caller::Loopback.as_str(), "loopback");
    }

    #[test]
    fn generate_token_is_unique() {
        let t1 = generate_token();
        let t2 = generate_token();
        assert_ne!(t1, t2);
        assert!(!t1.is_empty());
    }

    #[test]
    fn rate_limiter_admits_up_to_max() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        let retry = limiter.check("a").unwrap_err();
        assert!((1..=60).contains(&retry));
    }

    #[test]
    fn rate_limiter_isolates_identities() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("b").is_ok());
        assert!(limiter.check("a").is_err());
    }

    #[test]
    fn rate_limiter_window_slides() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0).is_ok());
        assert!(limiter.check_at("a", t0 + Duration::from_secs(4)).is_ok());
        assert_eq!(limiter.check_at("a", t0 + Duration::from_secs(6)), Err(4));
        // The first admission has left the window.
        assert!(limiter.check_at("a", t0 + Duration::from_secs(10)).is_ok());
        assert!(limiter.check_at("a", t0 + Duration::from_secs(11)).is_err());
    }

    #[test]
    fn stream_token_is_single_use() {
        let mut store = StreamTokenStore::new(Duration::from_secs(60));
        let token = store.issue("run_a", &Caller::Loopback);
        assert_eq!(store.consume(&token, "run_a").as_deref(), Some("loopback"));
        assert!(store.consume(&token, "run_a").is_none());
    }

    #[test]
    fn stream_token_records_issuing_caller() {
        let mut store = StreamTokenStore::new(Duration::from_secs(60));
        let caller = Caller::from_key("data-secret");
        let token = store.issue("run_a", &caller);
        assert_eq!(store.tokens[&token].issued_to, caller.as_str());
        assert!(!store.tokens[&token].issued_to.contains("secret"));
        assert_eq!(store.consume(&token, "run_a"), Some(caller.as_str().to_string()));
    }

    #[test]
    fn stream_token_is_bound_to_its_run() {
        let mut store = StreamTokenStore::new(Duration::from_secs(60));
        let token = store.issue("run_a", &Caller::Loopback);
        assert!(store.consume(&token, "run_b").is_none());
        // A mismatched attempt burns the token.
        assert!(store.consume(&token, "run_a").is_none());
    }

    #[test]
    fn expired_stream_token_is_rejected() {
        let mut store = StreamTokenStore::new(Duration::from_secs(60));
        store.tokens.insert(
            "expired".to_string(),
            StreamToken {
                run_id: "run_a".into(),
                issued_to: "loopback".into(),
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(store.consume("expired", "run_a").is_none());
        assert!(store.consume("unknown", "run_a").is_none());
    }
}
