//! Parsing and normalization of 402 challenges.
//!
//! The `PAYMENT-REQUIRED` header carries base64 JSON with an array of
//! acceptable payments; the first entry is the protocol's intended choice.
//! Parsing is deliberately infallible at the type level: absence of the
//! header or any decode failure yields `None`, and the engine turns that
//! into a structured protocol error.

use http::HeaderMap;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::network;
use crate::proto::{PAYMENT_REQUIRED_HEADER, PaymentRequiredEnvelope, PaymentScheme, RawPaymentRequirement};
use crate::timestamp::UnixTimestamp;

/// A normalized 402 challenge: the first acceptable payment, with the
/// network resolved to an internal chain id. The amount is kept as the raw
/// wire string; interpretation happens at signing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub scheme: PaymentScheme,
    pub network: String,
    pub chain_id: u64,
    pub asset: String,
    pub pay_to: String,
    pub amount: String,
    pub facilitator: Option<String>,
    pub deadline: Option<UnixTimestamp>,
    pub scheme_version: u8,
}

pub struct PaymentRequestParser;

impl PaymentRequestParser {
    /// Extract and parse the challenge from response headers.
    /// `None` when the header is absent or undecodable.
    pub fn from_headers(headers: &HeaderMap) -> Option<PaymentRequest> {
        let value = headers.get(PAYMENT_REQUIRED_HEADER)?.to_str().ok()?;
        Self::parse_value(value)
    }

    /// Parse a raw header value. `None` (never an error) on any failure.
    pub fn parse_value(value: &str) -> Option<PaymentRequest> {
        let envelope = PaymentRequiredEnvelope::from_base64(value)?;
        let first = envelope.payment_requirements.into_iter().next()?;
        Self::normalize(first)
    }

    fn normalize(raw: RawPaymentRequirement) -> Option<PaymentRequest> {
        let scheme = match raw.scheme.as_str() {
            "exact" => PaymentScheme::Exact,
            "upto" => PaymentScheme::Upto,
            _ => return None,
        };
        let chain_id = Self::resolve_network(&raw.network)?;
        Some(PaymentRequest {
            scheme,
            network: raw.network,
            chain_id,
            asset: raw.asset,
            pay_to: raw.pay_to,
            amount: raw.max_amount_required,
            facilitator: raw.facilitator,
            deadline: raw.deadline.map(UnixTimestamp::from_secs),
            scheme_version: 1,
        })
    }

    /// Map a challenge's `network` field to an internal chain id.
    ///
    /// Accepts known network names, numeric EVM chain ids (mapped to internal
    /// ids where a mapping exists), and otherwise falls through to a plain
    /// numeric parse.
    pub fn resolve_network(network: &str) -> Option<u64> {
        if let Some(id) = network::chain_id_by_network_name(network) {
            return Some(id);
        }
        let numeric = network.parse::<u64>().ok()?;
        Some(network::chain_id_from_evm(numeric).unwrap_or(numeric))
    }
}

/// Parse a decimal token amount (in whole tokens) into smallest units.
///
/// `None` when the input is not a non-negative decimal or carries more
/// fractional digits than the token has decimals.
pub fn parse_amount(input: &str, decimals: u32) -> Option<u128> {
    let value = Decimal::from_str(input).ok()?;
    if value.is_sign_negative() {
        return None;
    }
    let scale = value.scale();
    if scale > decimals {
        return None;
    }
    let mantissa = value.mantissa().unsigned_abs();
    mantissa.checked_mul(10u128.pow(decimals - scale))
}

/// Format a smallest-unit amount as a decimal token string, trimming
/// trailing fractional zeros.
pub fn format_amount(value: u128, decimals: u32) -> String {
    let divisor = 10u128.pow(decimals);
    let whole = value / divisor;
    let frac = value % divisor;
    if frac == 0 {
        format!("{}", whole)
    } else {
        let frac_str = format!("{:0>width$}", frac, width = decimals as usize)
            .trim_end_matches('0')
            .to_string();
        format!("{}.{}", whole, frac_str)
    }
}
