//! Session lifecycle: creation, loading, limit enforcement, revocation.
//!
//! The manager composes the credential vault, the session store, the pure
//! ledger arithmetic and the token vault's revoke cascade. Concurrent
//! mutation of one session is serialized by a per-session mutex; the
//! authoritative spend commit re-checks the limits under that lock, so a
//! caller race can never push a session past its caps.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use alloy::primitives::Bytes;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::Rng;

use crate::credential::{CredentialError, CredentialVault, MasterCredential};
use crate::ledger::{self, DenyReason, SpendDecision};
use crate::session::{KeyHash, LedgerState, Session, SessionPolicy};
use crate::store::{SessionStore, StoreError};
use crate::timestamp::{Clock, SECONDS_PER_DAY};
use crate::token_vault::TokenVault;
use crate::usd::UsdAmount;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The proposed policy violates a structural constraint; nothing was
    /// persisted.
    #[error("invalid session policy: {field}")]
    InvalidPolicy { field: &'static str },
    #[error("storage failure")]
    StorageFailure(#[from] StoreError),
    /// Stored ledger state violates its own caps. The session is quarantined:
    /// unusable for spending but retained for audit.
    #[error("session ledger is corrupted; session quarantined")]
    LedgerCorruption,
    #[error("session not found")]
    NotFound,
    /// The authoritative commit refused the spend (typically a race with a
    /// concurrent spender).
    #[error("spend not allowed: {reason}")]
    Denied {
        reason: DenyReason,
        remaining: UsdAmount,
    },
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Creates, loads, revokes sessions and enforces their spending policies.
pub struct SessionManager {
    vault: Arc<CredentialVault>,
    store: Arc<dyn SessionStore>,
    tokens: Arc<TokenVault>,
    clock: Arc<dyn Clock>,
    locks: DashMap<KeyHash, Arc<Mutex<()>>>,
    quarantined: DashSet<KeyHash>,
}

impl SessionManager {
    pub fn new(
        vault: Arc<CredentialVault>,
        store: Arc<dyn SessionStore>,
        tokens: Arc<TokenVault>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vault,
            store,
            tokens,
            clock,
            locks: DashMap::new(),
            quarantined: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn token_vault(&self) -> &Arc<TokenVault> {
        &self.tokens
    }

    fn validate_policy(&self, policy: &SessionPolicy) -> Result<(), SessionError> {
        let now = self.clock.now();
        if policy.per_tx_cap.is_zero() {
            return Err(SessionError::InvalidPolicy {
                field: "perTransactionLimitUSD",
            });
        }
        if policy.per_tx_cap > policy.daily_cap {
            return Err(SessionError::InvalidPolicy {
                field: "perTransactionLimitUSD",
            });
        }
        if policy.expires_at <= now {
            return Err(SessionError::InvalidPolicy {
                field: "expiryTimestamp",
            });
        }
        if policy.expires_at > now + SECONDS_PER_DAY {
            return Err(SessionError::InvalidPolicy {
                field: "expiryTimestamp",
            });
        }
        if policy.allowed_chains.is_empty() {
            return Err(SessionError::InvalidPolicy {
                field: "allowedChains",
            });
        }
        Ok(())
    }

    /// Create a session for a master credential.
    ///
    /// Generates a fresh secp256k1 keypair, encrypts the scalar under the
    /// credential-derived key and persists the session. No network I/O.
    #[tracing::instrument(skip_all, fields(credential_id = %master.credential_id))]
    pub async fn create(
        &self,
        master: &MasterCredential,
        policy: SessionPolicy,
    ) -> Result<Session, SessionError> {
        self.validate_policy(&policy)?;

        // Rejection-sample a fresh scalar; `from_slice` refuses the
        // out-of-range values (probability ~2^-128 per draw).
        let signing_key = loop {
            let candidate: Zeroizing<[u8; 32]> = Zeroizing::new(rand::rng().random());
            if let Ok(key) = SigningKey::from_slice(candidate.as_ref()) {
                break key;
            }
        };
        let public_key = Bytes::from(
            signing_key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        );
        let key_hash = KeyHash::from_public_key(&public_key);

        let scalar = Zeroizing::new(signing_key.to_bytes().to_vec());
        let key = self.vault.derive_key(&master.credential_id).await?;
        let encrypted_private_key = self.vault.encrypt_to_string(&scalar, &key);

        let session = Session {
            key_hash,
            encrypted_private_key,
            public_key,
            policy,
            ledger: LedgerState::new(self.clock.now()),
            master_key_hash: master.key_hash,
        };
        self.store.put(&session).await?;
        tracing::info!(key_hash = %session.key_hash, "created session");
        Ok(session)
    }

    /// Load a session without checking its validity; callers ask explicitly
    /// via [`SessionManager::is_valid`].
    pub async fn load(&self, key_hash: &KeyHash) -> Result<Option<Session>, SessionError> {
        Ok(self.store.get(key_hash).await?)
    }

    /// A session is valid while it has not expired and is still present in
    /// the store.
    pub async fn is_valid(&self, session: &Session) -> Result<bool, SessionError> {
        if session.is_expired(self.clock.now()) {
            return Ok(false);
        }
        Ok(self.store.get(&session.key_hash).await?.is_some())
    }

    /// Check spending limits against the caller's copy of the session. The
    /// daily window is advanced in place first.
    pub fn check_limits(&self, session: &mut Session, amount: UsdAmount) -> SpendDecision {
        ledger::check(
            &session.policy,
            &mut session.ledger,
            amount,
            self.clock.now(),
        )
    }

    /// Authoritatively commit a spend.
    ///
    /// Takes the per-session lock, reloads the session, re-checks the limits
    /// and persists the updated ledger. This is the only place ledger state
    /// is mutated, which keeps `check → sign → record` races from ever
    /// exceeding a cap.
    #[tracing::instrument(skip(self), fields(key_hash = %key_hash, amount = %amount))]
    pub async fn record_spending(
        &self,
        key_hash: &KeyHash,
        amount: UsdAmount,
    ) -> Result<Session, SessionError> {
        let lock = self
            .locks
            .entry(*key_hash)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.quarantined.contains(key_hash) {
            return Err(SessionError::LedgerCorruption);
        }

        let mut session = self
            .store
            .get(key_hash)
            .await?
            .ok_or(SessionError::NotFound)?;

        if session.ledger.daily_spent > session.policy.daily_cap {
            self.quarantine(key_hash);
            return Err(SessionError::LedgerCorruption);
        }

        let now = self.clock.now();
        match ledger::record(&session.policy, &mut session.ledger, amount, now) {
            Ok(_remaining) => {}
            Err(ledger::LedgerError::NotAllowed { reason, remaining }) => {
                return Err(SessionError::Denied { reason, remaining });
            }
            Err(ledger::LedgerError::Overflow) => {
                self.quarantine(key_hash);
                return Err(SessionError::LedgerCorruption);
            }
        }

        self.store.put(&session).await?;
        Ok(session)
    }

    /// Revoke a session: delete it from the store and invalidate every token
    /// minted from it. Idempotent; absent sessions are not an error.
    #[tracing::instrument(skip(self), fields(key_hash = %key_hash))]
    pub async fn revoke(&self, key_hash: &KeyHash) -> Result<(), SessionError> {
        let removed = self.store.delete(key_hash).await?;
        let tokens_revoked = self.tokens.revoke_all_for_session(key_hash);
        if removed || tokens_revoked > 0 {
            tracing::info!(tokens_revoked, "revoked session");
        }
        Ok(())
    }

    /// All currently valid sessions belonging to a master credential.
    pub async fn sessions_for_master(
        &self,
        master_key_hash: &KeyHash,
    ) -> Result<Vec<Session>, SessionError> {
        let now = self.clock.now();
        let sessions = self.store.list_by_master(master_key_hash).await?;
        Ok(sessions.into_iter().filter(|s| !s.is_expired(now)).collect())
    }

    fn quarantine(&self, key_hash: &KeyHash) {
        tracing::error!(key_hash = %key_hash, "ledger corruption detected; quarantining session");
        self.quarantined.insert(*key_hash);
    }

    pub fn is_quarantined(&self, key_hash: &KeyHash) -> bool {
        self.quarantined.contains(key_hash)
    }
}
