//! Session keys and their persisted representation.
//!
//! A session is an ephemeral secp256k1 keypair bounded by a spending policy.
//! Its stable identity is the keccak-256 hash of the uncompressed public key
//! (`key_hash`), chain-agnostic by construction. The private scalar is stored
//! only as vault ciphertext; the plaintext exists nowhere in this module.
//!
//! The serialized layout (`keyHash`, `encryptedPrivateKey`, `publicKey`,
//! `config`, `metadata`, `masterKeyHash`) is part of the published interface
//! and read back by deployed stores; field names must not change.

use alloy::hex;
use alloy::primitives::{Address, Bytes, keccak256};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::timestamp::UnixTimestamp;
use crate::usd::UsdAmount;

/// The 32-byte chain-agnostic identity of a session (or master credential):
/// keccak-256 over the uncompressed public key. Hex-encoded with 0x prefix.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(pub [u8; 32]);

impl KeyHash {
    /// Hash an uncompressed (or any canonical) public-key encoding.
    pub fn from_public_key<T: AsRef<[u8]>>(public_key: T) -> Self {
        KeyHash(keccak256(public_key.as_ref()).0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash(0x{})", hex::encode(self.0))
    }
}

impl Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid key hash: must be 0x-prefixed and 64 hex chars")]
pub struct KeyHashParseError;

impl FromStr for KeyHash {
    type Err = KeyHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static KEY_HASH_REGEX: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid key hash regex"));
        if !KEY_HASH_REGEX.is_match(s) {
            return Err(KeyHashParseError);
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| KeyHashParseError)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyHashParseError)?;
        Ok(KeyHash(array))
    }
}

impl Serialize for KeyHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        KeyHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The spending policy carried by a session.
///
/// Caps are hard limits enforced by the ledger; `allowed_chains` holds
/// internal chain ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    #[serde(rename = "dailyLimitUSD")]
    pub daily_cap: UsdAmount,
    #[serde(rename = "perTransactionLimitUSD")]
    pub per_tx_cap: UsdAmount,
    #[serde(rename = "expiryTimestamp")]
    pub expires_at: UnixTimestamp,
    #[serde(rename = "allowedChains")]
    pub allowed_chains: Vec<u64>,
}

impl SessionPolicy {
    pub fn allows_chain(&self, chain_id: u64) -> bool {
        self.allowed_chains.contains(&chain_id)
    }
}

/// Running spend totals for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerState {
    pub created_at: UnixTimestamp,
    pub last_used_at: UnixTimestamp,
    #[serde(rename = "totalSpentUSD")]
    pub total_spent: UsdAmount,
    #[serde(rename = "dailySpentUSD")]
    pub daily_spent: UsdAmount,
    pub daily_reset_at: UnixTimestamp,
    #[serde(rename = "transactionCount")]
    pub tx_count: u64,
}

impl LedgerState {
    /// A fresh ledger at session creation time.
    pub fn new(now: UnixTimestamp) -> Self {
        Self {
            created_at: now,
            last_used_at: now,
            total_spent: UsdAmount::ZERO,
            daily_spent: UsdAmount::ZERO,
            daily_reset_at: now + crate::timestamp::SECONDS_PER_DAY,
            tx_count: 0,
        }
    }
}

/// A delegated session key: identity, encrypted scalar, policy and ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub key_hash: KeyHash,
    /// Vault ciphertext (or a legacy encoding); opaque outside the signer.
    pub encrypted_private_key: String,
    /// Uncompressed secp256k1 point (65 bytes, 0x04-prefixed).
    pub public_key: Bytes,
    #[serde(rename = "config")]
    pub policy: SessionPolicy,
    #[serde(rename = "metadata")]
    pub ledger: LedgerState,
    pub master_key_hash: KeyHash,
}

impl Session {
    /// The EVM address controlled by this session key, derived from the
    /// public point. `None` if the stored point is not a canonical
    /// uncompressed encoding.
    pub fn derived_address(&self) -> Option<Address> {
        let bytes: &[u8] = self.public_key.as_ref();
        let raw = match bytes.len() {
            65 if bytes[0] == 0x04 => &bytes[1..],
            64 => bytes,
            _ => return None,
        };
        Some(Address::from_raw_public_key(raw))
    }

    /// Whether the session has passed its expiry at `now`. Expiry is
    /// inclusive: at `now == expires_at` the session is no longer usable.
    pub fn is_expired(&self, now: UnixTimestamp) -> bool {
        now >= self.policy.expires_at
    }
}
