//! Wire types for the 402 payment protocol.
//!
//! This mirrors the structures exchanged over HTTP headers: the 402 challenge
//! (`PAYMENT-REQUIRED`), the signed payment proof carried on the retry
//! (`PAYMENT-SIGNATURE`), and the settlement report (`PAYMENT-RESPONSE`).
//! All three are base64-encoded JSON. Amounts are stringified decimals and
//! byte values are 0x-prefixed hex, validated on deserialization.

use alloy::hex;
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Debug, Display};

use crate::timestamp::UnixTimestamp;
use crate::util::b64;

/// Response header carrying the 402 challenge.
pub const PAYMENT_REQUIRED_HEADER: &str = "payment-required";
/// Request header carrying the signed payment proof on retry.
pub const PAYMENT_SIGNATURE_HEADER: &str = "payment-signature";
/// Response header carrying the settlement report after a paid retry.
pub const PAYMENT_RESPONSE_HEADER: &str = "payment-response";
/// Presence of this response header hands the flow off to a UCP collaborator.
pub const UCP_INITIATION_HEADER: &str = "x-ucp-initiation-url";

/// Decode a 0x-prefixed hex string into exactly `N` bytes.
///
/// All fixed-width wire fields (signatures, nonces) funnel through here so
/// they reject malformed input the same way.
fn fixed_hex<const N: usize>(value: &str, field: &str) -> Result<[u8; N], String> {
    let body = value
        .strip_prefix("0x")
        .ok_or_else(|| format!("{field} must be 0x-prefixed hex"))?;
    let bytes = hex::decode(body).map_err(|_| format!("{field} contains non-hex characters"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| format!("{field} must be {N} bytes, got {len}"))
}

/// The protocol version tag carried as `x402Version`.
///
/// Only version 1 exists; the tag is a unit struct so an unsupported version
/// can never be represented, only rejected at decode time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SchemeVersion;

impl SchemeVersion {
    pub const CURRENT: u8 = 1;
}

impl Serialize for SchemeVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::CURRENT)
    }
}

impl<'de> Deserialize<'de> for SchemeVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = u8::deserialize(deserializer)?;
        if version == Self::CURRENT {
            Ok(SchemeVersion)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported x402 version {version}, this crate speaks version {}",
                Self::CURRENT
            )))
        }
    }
}

/// Payment schemes accepted by the core: an exact amount, or anything up to
/// a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentScheme {
    Exact,
    Upto,
}

impl Display for PaymentScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentScheme::Exact => "exact",
            PaymentScheme::Upto => "upto",
        };
        write!(f, "{}", s)
    }
}

/// A 65-byte recoverable secp256k1 signature (`r ‖ s ‖ v`), carried on the
/// wire as 132 characters of 0x-prefixed hex.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl From<[u8; 65]> for EvmSignature {
    fn from(bytes: [u8; 65]) -> Self {
        EvmSignature(bytes)
    }
}

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // r ‖ s are noise in logs; the first word and the recovery byte are
        // enough to tell signatures apart.
        write!(
            f,
            "EvmSignature(0x{}…{:02x})",
            hex::encode(&self.0[..8]),
            self.0[64]
        )
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        fixed_hex::<65>(&s, "signature")
            .map(EvmSignature)
            .map_err(serde::de::Error::custom)
    }
}

/// The 32 random bytes that make an ERC-3009 authorization single-use.
/// Wire form is 0x-prefixed hex.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AuthorizationNonce(pub [u8; 32]);

impl Debug for AuthorizationNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorizationNonce(0x{})", hex::encode(self.0))
    }
}

impl Serialize for AuthorizationNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for AuthorizationNonce {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        fixed_hex::<32>(&s, "authorization nonce")
            .map(AuthorizationNonce)
            .map_err(serde::de::Error::custom)
    }
}

/// A precise on-chain token amount in base units (e.g. USDC with 6 decimals).
/// Serialized as a stringified decimal integer to prevent precision loss.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TokenAmount(pub U256);

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        TokenAmount(value)
    }
}

impl From<TokenAmount> for U256 {
    fn from(value: TokenAmount) -> Self {
        value.0
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = U256::from_str_radix(&s, 10)
            .map_err(|_| serde::de::Error::custom("amount must be a decimal integer string"))?;
        Ok(TokenAmount(value))
    }
}

/// EIP-712 structured data for ERC-3009-based authorization: who may move
/// how much, and within which validity window.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: AuthorizationNonce,
}

/// The signature plus the EIP-712 struct it covers.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPaymentPayload {
    pub signature: EvmSignature,
    pub authorization: TransferAuthorization,
}

/// The full signed payment proof carried in the `PAYMENT-SIGNATURE` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: SchemeVersion,
    pub scheme: PaymentScheme,
    pub network: String,
    pub payload: ExactPaymentPayload,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadCodecError {
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PaymentPayload {
    /// Canonical serialization: base64 of the JSON encoding.
    pub fn to_base64(&self) -> Result<String, PayloadCodecError> {
        let json = serde_json::to_vec(self)?;
        Ok(b64::encode(json))
    }

    pub fn from_base64(value: &str) -> Result<Self, PayloadCodecError> {
        let decoded = b64::decode(value)?;
        Ok(serde_json::from_slice(&decoded)?)
    }
}

/// One acceptable payment inside a 402 challenge, as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPaymentRequirement {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub asset: String,
    pub pay_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unix deadline (seconds) for the authorization validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The decoded body of a `PAYMENT-REQUIRED` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredEnvelope {
    #[serde(default)]
    pub payment_requirements: Vec<RawPaymentRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRequiredEnvelope {
    /// Decode a base64 header value; `None` on any failure.
    pub fn from_base64(value: &str) -> Option<Self> {
        let decoded = b64::decode(value).ok()?;
        serde_json::from_slice(&decoded).ok()
    }
}

/// The decoded body of a `PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SettlementResponse {
    /// Decode a base64 header value; `None` on any failure.
    pub fn from_base64(value: &str) -> Option<Self> {
        let decoded = b64::decode(value).ok()?;
        serde_json::from_slice(&decoded).ok()
    }
}
