//! EIP-712 signing of ERC-3009 `TransferWithAuthorization` messages.
//!
//! The signer turns a parsed 402 challenge plus a session into a signed,
//! replay-safe authorization: domain from the token deployment registry,
//! fresh 32-byte CSPRNG nonce, validity window `[0, deadline]`. Verification
//! recomputes the identical typed-data hash and recovers the signer, so a
//! third party can check an authorization out-of-band without any state.
//!
//! The session's plaintext scalar is materialized exactly once per
//! signature, inside [`AuthorizationSigner::sign`], in a zeroizing buffer.

use rand::Rng;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, FixedBytes, Signature, U256};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{SolStruct, eip712_domain};

use crate::credential::{CredentialError, CredentialVault};
use crate::network;
use crate::parser::{PaymentRequest, parse_amount};
use crate::proto::{
    AuthorizationNonce, EvmSignature, ExactPaymentPayload, PaymentPayload, PayloadCodecError,
    SchemeVersion, TokenAmount, TransferAuthorization,
};
use crate::session::Session;
use crate::timestamp::{Clock, UnixTimestamp};

sol! {
    /// ERC-3009 transfer authorization, as typed by the token contracts.
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// Validity window applied when the challenge carries no deadline (seconds).
pub const AUTHORIZATION_TTL: u64 = 300;

/// Scaled amounts below this threshold are read as whole-token values.
const WHOLE_TOKEN_CUTOFF: u128 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("payment amount is not a valid number")]
    InvalidAmount,
    #[error("pay-to address is not a valid EVM address")]
    InvalidPayTo,
    #[error("session key material is unusable")]
    InvalidSessionKey,
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error(transparent)]
    Encode(#[from] PayloadCodecError),
}

/// A signed authorization ready to be carried on the retry request.
#[derive(Debug, Clone)]
pub struct SignedAuthorization {
    pub signature: EvmSignature,
    pub authorization: TransferAuthorization,
    /// base64 of the canonical payment payload; the `PAYMENT-SIGNATURE`
    /// header value.
    pub payload_b64: String,
    pub deadline: UnixTimestamp,
    pub token_address: Address,
    pub token_decimals: u8,
    pub evm_chain_id: u64,
}

/// Signs ERC-3009 authorizations on behalf of sessions.
pub struct AuthorizationSigner {
    vault: Arc<CredentialVault>,
    clock: Arc<dyn Clock>,
}

impl AuthorizationSigner {
    pub fn new(vault: Arc<CredentialVault>, clock: Arc<dyn Clock>) -> Self {
        Self { vault, clock }
    }

    /// Resolve a challenge's `asset` field to a contract address and its
    /// decimals.
    ///
    /// A 42-char `0x` hex string is used verbatim; anything else is treated
    /// as a symbol against the deployment registry, falling back to the
    /// default USDC deployment with a warning.
    pub fn resolve_token(asset: &str, chain_id: u64) -> (Address, u8) {
        if asset.len() == 42 && asset.starts_with("0x") {
            if let Ok(address) = Address::from_str(asset) {
                return (address, network::token_decimals(&address));
            }
        }
        if let Some(deployment) = network::stablecoin_by_symbol(asset, chain_id) {
            return (deployment.address, deployment.decimals);
        }
        let fallback = network::default_usdc();
        tracing::warn!(
            asset,
            chain_id,
            fallback = %fallback.address,
            "unresolved token symbol; falling back to default USDC"
        );
        (fallback.address, fallback.decimals)
    }

    /// Interpret the challenge's amount string as smallest units.
    ///
    /// A value with a decimal point is whole tokens, scaled by the token's
    /// decimals. An integer is whole tokens while the scaled result stays
    /// below 10^9; larger values are taken as already-smallest-unit. The 402
    /// header is not self-describing, so this dual reading is part of the
    /// wire contract.
    pub fn interpret_amount(amount: &str, decimals: u8) -> Option<U256> {
        if amount.contains('.') {
            return parse_amount(amount, decimals as u32).map(U256::from);
        }
        let raw = amount.parse::<u128>().ok()?;
        let scaled = raw.checked_mul(10u128.pow(decimals as u32));
        match scaled {
            Some(scaled) if scaled < WHOLE_TOKEN_CUTOFF => Some(U256::from(scaled)),
            _ => Some(U256::from(raw)),
        }
    }

    /// Produce a signed `TransferWithAuthorization` for the request.
    #[tracing::instrument(skip_all, fields(key_hash = %session.key_hash, chain_id = request.chain_id))]
    pub async fn sign(
        &self,
        request: &PaymentRequest,
        session: &Session,
        credential_id: &str,
    ) -> Result<SignedAuthorization, SignError> {
        let (token_address, token_decimals) = Self::resolve_token(&request.asset, request.chain_id);
        let value =
            Self::interpret_amount(&request.amount, token_decimals).ok_or(SignError::InvalidAmount)?;
        let from = session.derived_address().ok_or(SignError::InvalidSessionKey)?;
        let to = Address::from_str(&request.pay_to).map_err(|_| SignError::InvalidPayTo)?;

        let now = self.clock.now();
        let deadline = request.deadline.unwrap_or(now + AUTHORIZATION_TTL);
        let nonce: [u8; 32] = rand::rng().random();

        let evm_chain_id = network::evm_chain_id(request.chain_id);
        let (name, version) = network::eip712_metadata(&token_address);
        let domain = eip712_domain! {
            name: name,
            version: version,
            chain_id: evm_chain_id,
            verifying_contract: token_address,
        };

        let message = TransferWithAuthorization {
            from,
            to,
            value,
            validAfter: U256::ZERO,
            validBefore: U256::from(deadline.as_secs()),
            nonce: FixedBytes(nonce),
        };
        let eip712_hash = message.eip712_signing_hash(&domain);

        // The plaintext scalar lives only inside this block; the buffer
        // zeroizes on drop and the derived signing key does the same.
        let signature = {
            let key = self.vault.derive_key(credential_id).await?;
            let scalar = self
                .vault
                .decrypt_stored(&session.encrypted_private_key, &key)?;
            let signer = PrivateKeySigner::from_slice(&scalar)
                .map_err(|_| SignError::InvalidSessionKey)?;
            signer
                .sign_hash_sync(&eip712_hash)
                .map_err(|e| SignError::Signing(e.to_string()))?
        };
        let signature = EvmSignature::from(signature.as_bytes());

        let authorization = TransferAuthorization {
            from,
            to,
            value: TokenAmount(value),
            valid_after: UnixTimestamp::from_secs(0),
            valid_before: deadline,
            nonce: AuthorizationNonce(nonce),
        };
        let payload = PaymentPayload {
            x402_version: SchemeVersion,
            scheme: request.scheme,
            network: request.network.clone(),
            payload: ExactPaymentPayload {
                signature,
                authorization,
            },
        };
        let payload_b64 = payload.to_base64()?;

        Ok(SignedAuthorization {
            signature,
            authorization,
            payload_b64,
            deadline,
            token_address,
            token_decimals,
            evm_chain_id,
        })
    }

    /// Verify an authorization against an expected signer.
    ///
    /// Recomputes the typed-data hash with the identical domain and recovers
    /// the signing address. Returns `false` on any decoding failure; never
    /// panics.
    pub fn verify(
        signature: &EvmSignature,
        authorization: &TransferAuthorization,
        expected_signer: &Address,
        evm_chain_id: u64,
        token_address: &Address,
    ) -> bool {
        let (name, version) = network::eip712_metadata(token_address);
        let domain = eip712_domain! {
            name: name,
            version: version,
            chain_id: evm_chain_id,
            verifying_contract: *token_address,
        };
        let message = TransferWithAuthorization {
            from: authorization.from,
            to: authorization.to,
            value: authorization.value.0,
            validAfter: U256::from(authorization.valid_after.as_secs()),
            validBefore: U256::from(authorization.valid_before.as_secs()),
            nonce: FixedBytes(authorization.nonce.0),
        };
        let eip712_hash = message.eip712_signing_hash(&domain);
        let Ok(signature) = Signature::from_raw_array(&signature.0) else {
            return false;
        };
        match signature.recover_address_from_prehash(&eip712_hash) {
            Ok(recovered) => &recovered == expected_signer,
            Err(_) => false,
        }
    }
}
