use serde::{Deserialize, Serialize};

/// Persisted sessions older than this are not resumed.
pub const SESSION_TOKEN_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

/// Server session id saved between runs so the next start can resume it.
/// Only ever written to disk encrypted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub sid: String,
    /// Epoch milliseconds at which the sid was issued.
    pub timestamp: u64,
}

impl SessionToken {
    pub fn new(sid: impl Into<String>, timestamp: u64) -> Self {
        Self {
            sid: sid.into(),
            timestamp,
        }
    }

    /// A token is resumable when its sid is non-empty and
    /// `0 <= now - timestamp < 24h`. Tokens stamped in the future are rejected.
    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        if self.sid.is_empty() {
            return false;
        }
        match now_ms.checked_sub(self.timestamp) {
            Some(age) => age < SESSION_TOKEN_MAX_AGE_MS,
            None => false,
        }
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("sid", &"[REDACTED]")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    #[test]
    fn fresh_token_is_valid() {
        assert!(SessionToken::new("abc", NOW).is_valid_at(NOW));
        assert!(SessionToken::new("abc", NOW - 1000).is_valid_at(NOW));
    }

    #[test]
    fn token_just_under_a_day_is_valid() {
        let token = SessionToken::new("abc", NOW - SESSION_TOKEN_MAX_AGE_MS + 1);
        assert!(token.is_valid_at(NOW));
    }

    #[test]
    fn token_exactly_a_day_old_is_rejected() {
        let token = SessionToken::new("abc", NOW - SESSION_TOKEN_MAX_AGE_MS);
        assert!(!token.is_valid_at(NOW));
    }

    #[test]
    fn token_older_than_a_day_is_rejected() {
        let token = SessionToken::new("abc", NOW - SESSION_TOKEN_MAX_AGE_MS - 60_000);
        assert!(!token.is_valid_at(NOW));
    }

    #[test]
    fn empty_sid_is_rejected() {
        assert!(!SessionToken::new("", NOW).is_valid_at(NOW));
    }

    #[test]
    fn future_timestamp_is_rejected() {
        assert!(!SessionToken::new("abc", NOW + 5_000).is_valid_at(NOW));
    }

    #[test]
    fn debug_redacts_sid() {
        let dbg = format!("{:?}", SessionToken::new("secret-sid", NOW));
        assert!(!dbg.contains("secret-sid"));
    }
}
