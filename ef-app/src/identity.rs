//! Durable user identity from rotating per-connection tokens and phone
//! numbers.

use dashmap::DashMap;
use ef_channels::{Token, UserId};
use ef_stores::{Result, UserStore};
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of a token resolution; `newly_minted` identities have no profile
/// in the user store yet.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub user_id: UserId,
    pub newly_minted: bool,
}

pub struct IdentityResolver {
    users: Arc<dyn UserStore>,
    cache: DashMap<Token, UserId>,
}

impl IdentityResolver {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self {
            users,
            cache: DashMap::new(),
        }
    }

    /// Token to durable identity: cache, then store lookup, then a freshly
    /// minted identity for tokens never seen before.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn resolve(&self, token: &Token) -> Result<ResolvedIdentity> {
        if let Some(user_id) = self.cache.get(token) {
            return Ok(ResolvedIdentity {
                user_id: user_id.clone(),
                newly_minted: false,
            });
        }

        if let Some(record) = self.users.get_by_token(token.as_str()).await? {
            return Ok(ResolvedIdentity {
                user_id: UserId::new(record.id),
                newly_minted: false,
            });
        }

        Ok(ResolvedIdentity {
            user_id: UserId::new(Uuid::new_v4().to_string()),
            newly_minted: true,
        })
    }

    /// Registers a resolved mapping for later lookups. Idempotent.
    pub fn remember(&self, token: Token, user_id: UserId) {
        self.cache.insert(token, user_id);
    }
}

/// Normalizes free-text phone input to an E.164-looking number.
///
/// Total function: malformed input yields a syntactically plausible but
/// possibly wrong number rather than an error.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if raw.trim_start().starts_with('+') {
        return format!("+{digits}");
    }
    if digits.starts_with('1') {
        format!("+{digits}")
    } else {
        format!("+1{digits}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_stores::{MemoryUserStore, UserRecord};

    #[test]
    fn normalize_strips_punctuation_and_prepends_country_code() {
        assert_eq!(normalize_phone("512-555-1234"), "+15125551234");
        assert_eq!(normalize_phone("(512) 555 1234"), "+15125551234");
        assert_eq!(normalize_phone("15125551234"), "+15125551234");
    }

    #[test]
    fn normalize_preserves_explicit_plus_prefix() {
        assert_eq!(normalize_phone("+44 20 7946 0958"), "+442079460958");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["512-555-1234", "+44 20 7946 0958", "garbage", ""] {
            let once = normalize_phone(input);
            assert_eq!(normalize_phone(&once), once);
        }
    }

    #[tokio::test]
    async fn resolve_prefers_cache_then_store_then_mints() {
        let users = Arc::new(MemoryUserStore::new());
        users
            .insert(UserRecord {
                id: "u-known".to_string(),
                token: Some("tok-known".to_string()),
                name: None,
            })
            .await;
        let resolver = IdentityResolver::new(users);

        let known = resolver
            .resolve(&Token::new("tok-known"))
            .await
            .expect("resolve known");
        assert_eq!(known.user_id.as_str(), "u-known");
        assert!(!known.newly_minted);

        let fresh = resolver
            .resolve(&Token::new("tok-fresh"))
            .await
            .expect("resolve fresh");
        assert!(fresh.newly_minted);

        resolver.remember(Token::new("tok-fresh"), fresh.user_id.clone());
        let cached = resolver
            .resolve(&Token::new("tok-fresh"))
            .await
            .expect("resolve cached");
        assert_eq!(cached.user_id, fresh.user_id);
        assert!(!cached.newly_minted);
    }
}
