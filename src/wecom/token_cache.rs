use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Cached access token with its expiry deadline
#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Process-wide access-token cache, keyed by tenant + secret.
///
/// WeCom rate-limits token issuance, so every send reuses the cached token
/// until the safety margin before its stated TTL.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: DashMap<String, CachedToken>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn cache_key(corp_id: &str, corp_secret: &str) -> String {
        format!("{corp_id}\u{1f}{corp_secret}")
    }

    /// Get a token if present and not yet expired
    pub fn get(&self, corp_id: &str, corp_secret: &str) -> Option<String> {
        let key = Self::cache_key(corp_id, corp_secret);
        let entry = self.entries.get(&key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(&key);
            None
        } else {
            Some(entry.token.clone())
        }
    }

    /// Store a token valid for `ttl` from now
    pub fn insert(&self, corp_id: &str, corp_secret: &str, token: String, ttl: Duration) {
        self.entries.insert(
            Self::cache_key(corp_id, corp_secret),
            CachedToken {
                token,
                expires_at: Instant::now() + ttl,
            },
        );
    }

}
