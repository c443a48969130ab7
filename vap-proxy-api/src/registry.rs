//! Per-container bearer tokens and their rate windows.

use dashmap::DashMap;

/// What a registered token is bound to.
#[derive(Debug, Clone)]
pub struct TokenBinding {
    pub job_id: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: u64,
}

/// token → binding, token → rate window. Revocation removes both entries
/// synchronously; validity is re-checked on every proxy call.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: DashMap<String, TokenBinding>,
    windows: DashMap<String, RateWindow>,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 32 random bytes, hex encoded.
    pub fn generate_token() -> String {
        hex::encode(rand::random::<[u8; 32]>())
    }

    pub fn register(&self, token: &str, job_id: &str) {
        self.tokens.insert(
            token.to_string(),
            TokenBinding { job_id: job_id.to_string(), created_at: now_secs() },
        );
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
        self.windows.remove(token);
    }

    /// Job bound to the token, or `None` for unknown/revoked tokens.
    pub fn job_for(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.job_id.clone())
    }

    pub fn is_registered(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Count a request against the token's 60-second window. Returns
    /// `false` once `limit` requests have been counted in the window.
    pub fn check_rate(&self, token: &str, limit: u32) -> bool {
        self.check_rate_at(token, limit, now_secs())
    }

    pub fn check_rate_at(&self, token: &str, limit: u32, now: u64) -> bool {
        let mut window = self
            .windows
            .entry(token.to_string())
            .or_insert(RateWindow { count: 0, window_start: now });
        if now.saturating_sub(window.window_start) >= 60 {
            window.count = 0;
            window.window_start = now;
        }
        if window.count >= limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_256_bit_and_unique() {
        let a = TokenRegistry::generate_token();
        let b = TokenRegistry::generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_lookup_revoke() {
        let registry = TokenRegistry::new();
        let token = TokenRegistry::generate_token();
        registry.register(&token, "job-1");

        assert_eq!(registry.job_for(&token).as_deref(), Some("job-1"));
        assert_eq!(registry.len(), 1);

        registry.revoke(&token);
        assert!(registry.job_for(&token).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rate_window_caps_and_resets() {
        let registry = TokenRegistry::new();
        let now = 1_000_000;
        for _ in 0..5 {
            assert!(registry.check_rate_at("tok", 5, now));
        }
        assert!(!registry.check_rate_at("tok", 5, now + 30));
        // Window expires 60s after it opened.
        assert!(registry.check_rate_at("tok", 5, now + 60));
    }

    #[test]
    fn test_rate_windows_are_per_token() {
        let registry = TokenRegistry::new();
        let now = 1_000_000;
        assert!(registry.check_rate_at("a", 1, now));
        assert!(!registry.check_rate_at("a", 1, now));
        assert!(registry.check_rate_at("b", 1, now));
    }

    #[test]
    fn test_revoke_clears_rate_window() {
        let registry = TokenRegistry::new();
        let now = 1_000_000;
        registry.register("tok", "job-1");
        assert!(registry.check_rate_at("tok", 1, now));
        assert!(!registry.check_rate_at("tok", 1, now));

        registry.revoke("tok");
        registry.register("tok", "job-1");
        // Fresh registration starts a fresh window.
        assert!(registry.check_rate_at("tok", 1, now));
    }
}
