//! Base64 codecs for the two alphabets this crate speaks.
//!
//! HTTP payment headers carry standard-alphabet base64 of JSON documents;
//! payment token strings use the url-safe unpadded alphabet so they survive
//! query strings and path segments untouched.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

/// Encode bytes for a payment header value.
pub fn encode(input: impl AsRef<[u8]>) -> String {
    STANDARD.encode(input.as_ref())
}

/// Decode a payment header value.
pub fn decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(input)
}

/// Encode bytes for a payment token string.
pub fn encode_url_safe(input: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(input.as_ref())
}

/// Decode a payment token string.
pub fn decode_url_safe(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(input)
}
