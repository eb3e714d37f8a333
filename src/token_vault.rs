//! Short-lived payment tokens.
//!
//! A payment token is an opaque, tamper-evident handle minted from a session.
//! It carries a snapshot of the session's limits and confers no signing
//! authority by itself; higher layers hand it to third parties as a narrow,
//! time-boxed capability. Tokens live in a shared in-memory index keyed by
//! the token string and die by their own expiry, by explicit revoke, or
//! transitively when the underlying session is revoked.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use alloy::hex;

use crate::error::ErrorCode;
use crate::session::{KeyHash, Session};
use crate::store::SessionStore;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::usd::UsdAmount;
use crate::util::b64;

/// Discriminator embedded in every token; other types are rejected outright.
pub const TOKEN_TYPE: &str = "VERIDEX_SESSION_TOKEN";

/// Default token lifetime when the caller does not pass one (seconds).
pub const DEFAULT_TOKEN_TTL: u64 = 15 * 60;

/// The session limits frozen into a token at mint time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimits {
    #[serde(rename = "dailyLimitUSD")]
    pub daily_cap: UsdAmount,
    #[serde(rename = "perTransactionLimitUSD")]
    pub per_tx_cap: UsdAmount,
}

/// The JSON document inside a token string.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    #[serde(rename = "keyHash")]
    key_hash: KeyHash,
    #[serde(rename = "type")]
    token_type: String,
    limits: TokenLimits,
    #[serde(rename = "expiresAt")]
    expires_at: UnixTimestamp,
    /// 16 CSPRNG bytes, hex-encoded; makes every mint distinct.
    nonce: String,
}

/// A minted payment token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentToken {
    /// The opaque token string (url-safe base64 of the claims).
    pub token: String,
    pub session_key_hash: KeyHash,
    pub limits: TokenLimits,
    pub expires_at: UnixTimestamp,
}

/// Why a token failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// Not decodable as a token at all.
    Malformed,
    /// Structurally valid but unknown to this vault (stale or minted
    /// elsewhere).
    NotFound,
    /// The token itself has expired.
    Expired,
    /// The session behind the token has expired.
    SessionExpired,
    /// The session behind the token no longer exists.
    SessionRevoked,
}

impl Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::NotFound => "not found",
            TokenRejection::Expired => "expired",
            TokenRejection::SessionExpired => "underlying session expired",
            TokenRejection::SessionRevoked => "session revoked",
        };
        write!(f, "{}", s)
    }
}

impl TokenRejection {
    pub const fn code(&self) -> ErrorCode {
        match self {
            TokenRejection::Malformed | TokenRejection::NotFound => ErrorCode::TokenInvalid,
            TokenRejection::Expired | TokenRejection::SessionExpired => ErrorCode::TokenExpired,
            TokenRejection::SessionRevoked => ErrorCode::TokenRevoked,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    key_hash: KeyHash,
    expires_at: UnixTimestamp,
}

/// Mints, validates, refreshes and revokes payment tokens.
pub struct TokenVault {
    index: DashMap<String, IndexEntry>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            index: DashMap::new(),
            store,
            clock,
        }
    }

    /// Mint a token for a session, valid for `ttl` seconds (default
    /// [`DEFAULT_TOKEN_TTL`]) but never past the session's own expiry.
    #[tracing::instrument(skip_all, fields(key_hash = %session.key_hash))]
    pub fn mint(&self, session: &Session, ttl: Option<u64>) -> PaymentToken {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(DEFAULT_TOKEN_TTL);
        let expires_at = std::cmp::min(now + ttl, session.policy.expires_at);
        let nonce: [u8; 16] = rand::rng().random();
        let limits = TokenLimits {
            daily_cap: session.policy.daily_cap,
            per_tx_cap: session.policy.per_tx_cap,
        };
        let claims = TokenClaims {
            key_hash: session.key_hash,
            token_type: TOKEN_TYPE.to_string(),
            limits,
            expires_at,
            nonce: format!("0x{}", hex::encode(nonce)),
        };
        let json = serde_json::to_vec(&claims).expect("token claims always serialize");
        let token = b64::encode_url_safe(json);
        self.index.insert(
            token.clone(),
            IndexEntry {
                key_hash: session.key_hash,
                expires_at,
            },
        );
        PaymentToken {
            token,
            session_key_hash: session.key_hash,
            limits,
            expires_at,
        }
    }

    fn decode_claims(token: &str) -> Option<TokenClaims> {
        let bytes = b64::decode_url_safe(token).ok()?;
        let claims: TokenClaims = serde_json::from_slice(&bytes).ok()?;
        if claims.token_type != TOKEN_TYPE {
            return None;
        }
        Some(claims)
    }

    async fn load_session(&self, key_hash: &KeyHash) -> Option<Session> {
        match self.store.get(key_hash).await {
            Ok(session) => session,
            Err(e) => {
                // A failing store reads as an absent session here; storage
                // failures surface on the session-manager paths instead.
                tracing::error!(error = %e, "session store failed during token validation");
                None
            }
        }
    }

    /// Validate a token string and return the session it delegates for.
    #[tracing::instrument(skip_all)]
    pub async fn validate(&self, token: &str) -> Result<Session, TokenRejection> {
        let now = self.clock.now();

        let Some(entry) = self.index.get(token).map(|e| *e.value()) else {
            // Unknown to this vault: distinguish garbage, revoked-session
            // tokens, and tokens minted elsewhere.
            let claims = Self::decode_claims(token).ok_or(TokenRejection::Malformed)?;
            return match self.load_session(&claims.key_hash).await {
                None => Err(TokenRejection::SessionRevoked),
                Some(_) => Err(TokenRejection::NotFound),
            };
        };

        if entry.expires_at <= now {
            self.index.remove(token);
            return Err(TokenRejection::Expired);
        }

        let Some(session) = self.load_session(&entry.key_hash).await else {
            self.index.remove(token);
            return Err(TokenRejection::SessionRevoked);
        };

        if session.is_expired(now) {
            self.index.remove(token);
            return Err(TokenRejection::SessionExpired);
        }

        Ok(session)
    }

    /// Atomically validate and consume `old_token`, then mint a replacement.
    /// Returns `None` if the old token was not valid (or was consumed by a
    /// concurrent refresh).
    pub async fn refresh(&self, old_token: &str, session: &Session) -> Option<PaymentToken> {
        self.validate(old_token).await.ok()?;
        // The remove is the claim; a concurrent refresh of the same token
        // loses here and returns None.
        self.index.remove(old_token)?;
        Some(self.mint(session, None))
    }

    /// Remove a token from the index. Idempotent; returns whether the token
    /// was present.
    pub fn revoke(&self, token: &str) -> bool {
        self.index.remove(token).is_some()
    }

    /// Remove every token minted for a session; called on session revoke.
    /// Returns the number of tokens removed.
    #[tracing::instrument(skip(self), fields(key_hash = %key_hash))]
    pub fn revoke_all_for_session(&self, key_hash: &KeyHash) -> usize {
        let before = self.index.len();
        self.index.retain(|_, entry| &entry.key_hash != key_hash);
        before - self.index.len()
    }

    /// Drop every expired index entry. Safe to run from a background ticker;
    /// a second immediate call removes nothing.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.index.len();
        self.index.retain(|_, entry| entry.expires_at > now);
        before - self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{LedgerState, SessionPolicy};
    use crate::store::MemorySessionStore;
    use crate::timestamp::ManualClock;
    use alloy::primitives::Bytes;

    const T0: u64 = 1_700_000_000;

    fn session(expires_offset: u64, seed: u8) -> Session {
        let mut pk = vec![0x04u8];
        pk.extend_from_slice(&[seed; 64]);
        let public_key = Bytes::from(pk);
        Session {
            key_hash: KeyHash::from_public_key(&public_key),
            encrypted_private_key: "0xffff".repeat(24),
            public_key,
            policy: SessionPolicy {
                daily_cap: UsdAmount::from_dollars(100),
                per_tx_cap: UsdAmount::from_dollars(25),
                expires_at: UnixTimestamp::from_secs(T0 + expires_offset),
                allowed_chains: vec![crate::network::chains::BASE],
            },
            ledger: LedgerState::new(UnixTimestamp::from_secs(T0)),
            master_key_hash: KeyHash([0xaa; 32]),
        }
    }

    async fn vault_with(
        sessions: &[&Session],
    ) -> (TokenVault, Arc<MemorySessionStore>, Arc<ManualClock>) {
        let store = Arc::new(MemorySessionStore::new());
        for s in sessions {
            store.put(s).await.unwrap();
        }
        let clock = Arc::new(ManualClock::at(T0));
        let vault = TokenVault::new(store.clone(), clock.clone());
        (vault, store, clock)
    }

    #[tokio::test]
    async fn test_mint_bounds_expiry_to_session() {
        let session = session(60, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;

        // Requested TTL far beyond the session expiry is clamped.
        let token = vault.mint(&session, Some(3600));
        assert_eq!(token.expires_at, session.policy.expires_at);

        // A short TTL stands on its own.
        let short = vault.mint(&session, Some(10));
        assert_eq!(short.expires_at, UnixTimestamp::from_secs(T0 + 10));

        assert_eq!(token.limits.daily_cap, session.policy.daily_cap);
        assert_eq!(token.limits.per_tx_cap, session.policy.per_tx_cap);
    }

    #[tokio::test]
    async fn test_validate_happy_path() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        let token = vault.mint(&session, None);
        let validated = vault.validate(&token.token).await.unwrap();
        assert_eq!(validated.key_hash, session.key_hash);
    }

    #[tokio::test]
    async fn test_validate_expired_token_is_evicted() {
        let session = session(3600, 1);
        let (vault, _store, clock) = vault_with(&[&session]).await;
        let token = vault.mint(&session, Some(10));

        clock.advance(10);
        assert_eq!(
            vault.validate(&token.token).await.unwrap_err(),
            TokenRejection::Expired
        );
        // Evicted: the second failure comes from the structural path, and
        // since the session still exists the token reads as stale.
        assert_eq!(
            vault.validate(&token.token).await.unwrap_err(),
            TokenRejection::NotFound
        );
    }

    #[tokio::test]
    async fn test_validate_underlying_session_expired() {
        let session = session(60, 1);
        let (vault, _store, clock) = vault_with(&[&session]).await;
        let token = vault.mint(&session, Some(3600));

        clock.advance(60);
        assert_eq!(
            vault.validate(&token.token).await.unwrap_err(),
            TokenRejection::SessionExpired
        );
    }

    #[tokio::test]
    async fn test_malformed_token() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        assert_eq!(
            vault.validate("not-a-token").await.unwrap_err(),
            TokenRejection::Malformed
        );
    }

    #[tokio::test]
    async fn test_wrong_token_type_is_malformed() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        let claims = serde_json::json!({
            "keyHash": session.key_hash,
            "type": "SOME_OTHER_TOKEN",
            "limits": {"dailyLimitUSD": "100", "perTransactionLimitUSD": "25"},
            "expiresAt": "1700003600",
            "nonce": "0x00000000000000000000000000000000"
        });
        let token = b64::encode_url_safe(serde_json::to_vec(&claims).unwrap());
        assert_eq!(
            vault.validate(&token).await.unwrap_err(),
            TokenRejection::Malformed
        );
    }

    #[tokio::test]
    async fn test_foreign_token_not_found() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        // Structurally valid token that this vault never minted, while the
        // session itself is alive.
        let other_vault = TokenVault::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(ManualClock::at(T0)),
        );
        let foreign = other_vault.mint(&session, None);
        assert_eq!(
            vault.validate(&foreign.token).await.unwrap_err(),
            TokenRejection::NotFound
        );
    }

    #[tokio::test]
    async fn test_revoke_cascade() {
        let session = session(3600, 1);
        let (vault, store, _clock) = vault_with(&[&session]).await;
        let token_a = vault.mint(&session, None);
        let token_b = vault.mint(&session, None);
        assert!(vault.validate(&token_a.token).await.is_ok());
        assert!(vault.validate(&token_b.token).await.is_ok());

        // Session revoke: the store entry goes away, then the cascade.
        store.delete(&session.key_hash).await.unwrap();
        assert_eq!(vault.revoke_all_for_session(&session.key_hash), 2);

        assert_eq!(
            vault.validate(&token_a.token).await.unwrap_err(),
            TokenRejection::SessionRevoked
        );
        assert_eq!(
            vault.validate(&token_b.token).await.unwrap_err(),
            TokenRejection::SessionRevoked
        );
    }

    #[tokio::test]
    async fn test_revoke_twice() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        let token = vault.mint(&session, None);
        assert!(vault.revoke(&token.token));
        assert!(!vault.revoke(&token.token));
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        let old = vault.mint(&session, None);

        let new = vault.refresh(&old.token, &session).await.unwrap();
        assert_ne!(new.token, old.token);
        assert!(vault.validate(&new.token).await.is_ok());
        // The consumed token no longer validates (session is alive, so it
        // reads as stale).
        assert_eq!(
            vault.validate(&old.token).await.unwrap_err(),
            TokenRejection::NotFound
        );
        // And refreshing it again yields nothing.
        assert!(vault.refresh(&old.token, &session).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let session = session(3600, 1);
        let (vault, _store, clock) = vault_with(&[&session]).await;
        vault.mint(&session, Some(10));
        vault.mint(&session, Some(20));
        vault.mint(&session, Some(3600));

        clock.advance(30);
        assert_eq!(vault.cleanup(), 2);
        assert_eq!(vault.cleanup(), 0);
    }

    #[tokio::test]
    async fn test_token_wire_shape() {
        let session = session(3600, 1);
        let (vault, _store, _clock) = vault_with(&[&session]).await;
        let token = vault.mint(&session, None);
        let bytes = b64::decode_url_safe(&token.token).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], TOKEN_TYPE);
        assert!(json["keyHash"].is_string());
        assert!(json["limits"]["dailyLimitUSD"].is_string());
        assert!(json["limits"]["perTransactionLimitUSD"].is_string());
        assert!(json["expiresAt"].is_string());
        assert!(json["nonce"].as_str().unwrap().starts_with("0x"));
    }
}
