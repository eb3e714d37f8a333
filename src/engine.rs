//! The 402 negotiation state machine.
//!
//! One invocation walks a linear sequence of await points: issue the
//! original request, and on a 402 challenge parse it, value it in USD, check
//! the session's limits, sign an authorization, commit the spend, retry with
//! the proof, and interpret the settlement. Exactly one sign-and-retry
//! happens per invocation; if the retry fails, the caller decides whether to
//! run the whole flow again (with a fresh nonce, deadline and limit check).
//!
//! The spend is recorded *before* the retry. This is deliberate and
//! conservative: recording first prevents a double spend when the retry
//! races another agent thread, at the cost that a lost retry strands the
//! increment until a manual refund. Cancellation is cooperative — dropping
//! the returned future cancels any in-flight HTTP call, and a flow cancelled
//! before the record step leaves the ledger untouched.

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use alloy::primitives::Address;

use crate::alerts::AlertBus;
use crate::audit::{AuditLog, PaymentDraft, PaymentProtocol, PaymentStatus};
use crate::error::{EngineError, InternalError, PolicyError, ProtocolError, TransientError};
use crate::ledger::{DenyReason, SpendDecision};
use crate::manager::{SessionError, SessionManager};
use crate::network;
use crate::oracle::{self, PriceOracle};
use crate::parser::{PaymentRequest, PaymentRequestParser};
use crate::proto::{
    PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER, PAYMENT_SIGNATURE_HEADER,
    PaymentRequiredEnvelope, SettlementResponse, TokenAmount, UCP_INITIATION_HEADER,
};
use crate::session::KeyHash;
use crate::signer::AuthorizationSigner;
use crate::usd::UsdAmount;

/// Default cancellation deadline for each HTTP call.
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// An outbound HTTP request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

/// The outbound-HTTP capability. `send` must be cancellation-safe: dropping
/// the future aborts the request.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpClientError>;
}

/// Default [`HttpClient`] backed by `reqwest`.
#[derive(Clone, Default)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpClientError::Timeout
            } else {
                HttpClientError::Transport(e.to_string())
            }
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpClientError::Transport(e.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Master credential id used to derive the session decryption key.
    pub credential_id: String,
    /// Per-HTTP-call deadline.
    pub payment_timeout: Duration,
}

impl EngineConfig {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            payment_timeout: DEFAULT_PAYMENT_TIMEOUT,
        }
    }
}

/// What a paid request cost and how it settled.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    pub amount_usd: UsdAmount,
    pub amount_smallest_unit: TokenAmount,
    /// Token symbol or address as carried in the challenge.
    pub token: String,
    pub token_address: Address,
    pub chain_id: u64,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub settlement: Option<SettlementResponse>,
    /// Audit record id, when the append succeeded.
    pub audit_id: Option<String>,
}

/// Outcome of [`X402Engine::handle_fetch`].
#[derive(Debug)]
pub enum FetchOutcome {
    /// The server did not ask for payment; the response is passed through
    /// unchanged.
    Passthrough(HttpResponse),
    /// The server asked for a UCP handoff; completing it belongs to a
    /// collaborator, the challenge response is returned unchanged.
    UcpHandoff {
        response: HttpResponse,
        initiation_url: String,
    },
    /// A payment was signed and the retry succeeded.
    Paid {
        response: HttpResponse,
        receipt: PaymentReceipt,
    },
}

/// Orchestrates parse → policy → sign → record → retry → settlement.
pub struct X402Engine {
    http: Arc<dyn HttpClient>,
    manager: Arc<SessionManager>,
    signer: AuthorizationSigner,
    oracle: Arc<dyn PriceOracle>,
    alerts: Arc<AlertBus>,
    audit: Arc<AuditLog>,
    config: EngineConfig,
}

impl X402Engine {
    pub fn new(
        http: Arc<dyn HttpClient>,
        manager: Arc<SessionManager>,
        signer: AuthorizationSigner,
        oracle: Arc<dyn PriceOracle>,
        alerts: Arc<AlertBus>,
        audit: Arc<AuditLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            http,
            manager,
            signer,
            oracle,
            alerts,
            audit,
            config,
        }
    }

    async fn send_with_timeout(&self, request: &HttpRequest) -> Result<HttpResponse, EngineError> {
        let result = timeout(self.config.payment_timeout, self.http.send(request)).await;
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(HttpClientError::Timeout)) => Err(TransientError::Timeout.into()),
            Ok(Err(HttpClientError::Transport(msg))) => Err(TransientError::Network(msg).into()),
            Err(_) => Err(TransientError::Timeout.into()),
        }
    }

    /// USD value of the challenge amount. Stablecoins (by symbol or known
    /// address) short-circuit to their peg; everything else asks the oracle
    /// and truncates.
    async fn value_in_usd(
        &self,
        request: &PaymentRequest,
        token_address: &Address,
        amount: alloy::primitives::U256,
        decimals: u8,
    ) -> Result<UsdAmount, EngineError> {
        let is_stablecoin = network::stablecoin_by_symbol(&request.asset, request.chain_id)
            .is_some()
            || network::stablecoin_by_address(token_address).is_some();
        if is_stablecoin {
            return oracle::pegged_usd_value(amount, decimals)
                .map_err(|e| TransientError::Oracle(e.to_string()).into());
        }
        self.oracle
            .token_value_usd(request.chain_id, token_address, amount, decimals)
            .await
            .map_err(|e| TransientError::Oracle(e.to_string()).into())
    }

    fn deny_to_policy_error(reason: DenyReason) -> PolicyError {
        match reason {
            DenyReason::Expired => PolicyError::Expired,
            DenyReason::PerTransactionLimit => PolicyError::PerTxExceeded {
                reason: reason.to_string(),
            },
            DenyReason::DailyLimit => PolicyError::DailyExceeded {
                reason: reason.to_string(),
            },
        }
    }

    fn session_error(error: SessionError) -> EngineError {
        match error {
            SessionError::NotFound => PolicyError::SessionInvalid.into(),
            SessionError::Denied { reason, .. } => Self::deny_to_policy_error(reason).into(),
            SessionError::StorageFailure(e) => InternalError::Storage(e).into(),
            SessionError::LedgerCorruption => InternalError::LedgerCorruption.into(),
            SessionError::Credential(e) => {
                EngineError::Crypto(crate::signer::SignError::Credential(e))
            }
            SessionError::InvalidPolicy { .. } => {
                // create() is the only producer of this variant; reaching it
                // here means a programming error upstream, surfaced as an
                // invalid session rather than a panic.
                PolicyError::SessionInvalid.into()
            }
        }
    }

    /// Issue a request on behalf of a session, negotiating a 402 challenge
    /// if one comes back.
    #[tracing::instrument(skip_all, fields(url = %request.url, key_hash = %session_key_hash))]
    pub async fn handle_fetch(
        &self,
        request: HttpRequest,
        session_key_hash: &KeyHash,
    ) -> Result<FetchOutcome, EngineError> {
        let initial = self.send_with_timeout(&request).await?;

        if initial.status != StatusCode::PAYMENT_REQUIRED {
            return Ok(FetchOutcome::Passthrough(initial));
        }
        tracing::debug!("received 402 Payment Required");

        if let Some(url) = initial
            .headers
            .get(UCP_INITIATION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let initiation_url = url.to_string();
            tracing::debug!(%initiation_url, "UCP initiation requested; handing off");
            return Ok(FetchOutcome::UcpHandoff {
                response: initial,
                initiation_url,
            });
        }

        let payment_request = PaymentRequestParser::from_headers(&initial.headers)
            .ok_or(ProtocolError::MalformedChallenge)?;

        let mut session = self
            .manager
            .load(session_key_hash)
            .await
            .map_err(Self::session_error)?
            .ok_or(PolicyError::SessionInvalid)?;

        if !session.policy.allows_chain(payment_request.chain_id) {
            return Err(PolicyError::ChainNotAllowed {
                chain_id: payment_request.chain_id,
            }
            .into());
        }

        let (token_address, token_decimals) =
            AuthorizationSigner::resolve_token(&payment_request.asset, payment_request.chain_id);
        let amount = AuthorizationSigner::interpret_amount(&payment_request.amount, token_decimals)
            .ok_or(ProtocolError::MalformedChallenge)?;
        let amount_usd = self
            .value_in_usd(&payment_request, &token_address, amount, token_decimals)
            .await?;

        match self.manager.check_limits(&mut session, amount_usd) {
            SpendDecision::Allow { remaining } => {
                tracing::debug!(amount_usd = %amount_usd, remaining = %remaining, "limits allow payment");
            }
            SpendDecision::Deny { reason, .. } => {
                return Err(Self::deny_to_policy_error(reason).into());
            }
        }

        let signed = self
            .signer
            .sign(&payment_request, &session, &self.config.credential_id)
            .await?;

        // Commit before retrying. The authoritative record re-checks under
        // the session lock, so a concurrent spender surfaces here as a
        // policy denial instead of an overspend.
        let updated = self
            .manager
            .record_spending(session_key_hash, amount_usd)
            .await
            .map_err(Self::session_error)?;
        self.alerts.on_spending(
            session_key_hash,
            updated.ledger.daily_spent,
            updated.policy.daily_cap,
        );

        let mut retry = request.clone();
        retry.headers.insert(
            PAYMENT_SIGNATURE_HEADER,
            HeaderValue::from_str(&signed.payload_b64)
                .expect("base64 payload is always a valid header value"),
        );
        let retried = self.send_with_timeout(&retry).await?;

        if retried.status == StatusCode::PAYMENT_REQUIRED {
            let server_reason = retried
                .headers
                .get(PAYMENT_REQUIRED_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(PaymentRequiredEnvelope::from_base64)
                .and_then(|envelope| envelope.error)
                .unwrap_or_else(|| "payment not accepted".to_string());
            tracing::warn!(%server_reason, "server rejected the signed payment");
            self.append_audit(
                session_key_hash,
                &payment_request,
                amount,
                amount_usd,
                PaymentStatus::Failed,
                None,
            )
            .await;
            return Err(ProtocolError::PaymentRejected { server_reason }.into());
        }

        let settlement = retried
            .headers
            .get(PAYMENT_RESPONSE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(SettlementResponse::from_base64);

        let status = match &settlement {
            Some(s) if s.success => PaymentStatus::Confirmed,
            Some(s) => {
                // A failed settlement does not contradict the HTTP success
                // of the retried call; the response still goes back to the
                // caller.
                tracing::warn!(error = ?s.error, "settlement reported failure");
                PaymentStatus::Failed
            }
            None if retried.status.is_success() => PaymentStatus::Confirmed,
            None => PaymentStatus::Pending,
        };
        let tx_hash = settlement
            .as_ref()
            .and_then(|s| s.transaction_hash.clone());

        let audit_id = self
            .append_audit(
                session_key_hash,
                &payment_request,
                amount,
                amount_usd,
                status,
                tx_hash.clone(),
            )
            .await;

        Ok(FetchOutcome::Paid {
            response: retried,
            receipt: PaymentReceipt {
                amount_usd,
                amount_smallest_unit: TokenAmount(amount),
                token: payment_request.asset.clone(),
                token_address,
                chain_id: payment_request.chain_id,
                status,
                tx_hash,
                settlement,
                audit_id,
            },
        })
    }

    /// Append to the audit log. Failures are logged and swallowed: the
    /// payment already happened, losing the local audit entry is a
    /// degraded-mode condition.
    async fn append_audit(
        &self,
        session_key_hash: &KeyHash,
        request: &PaymentRequest,
        amount: alloy::primitives::U256,
        amount_usd: UsdAmount,
        status: PaymentStatus,
        tx_hash: Option<String>,
    ) -> Option<String> {
        let draft = PaymentDraft {
            session_key_hash: *session_key_hash,
            recipient: request.pay_to.clone(),
            amount_smallest_unit: TokenAmount(amount),
            amount_usd,
            token: request.asset.clone(),
            chain_id: request.chain_id,
            status,
            tx_hash,
            protocol: PaymentProtocol::X402,
        };
        match self.audit.log(draft).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                tracing::warn!(error = %e, "audit append failed; continuing");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertBus;
    use crate::audit::AuditFilter;
    use crate::credential::{CredentialVault, HkdfKeyDerivation, MasterCredential, MasterPublicKey};
    use crate::oracle::FixedPriceOracle;
    use crate::proto::PaymentPayload;
    use crate::session::SessionPolicy;
    use crate::store::{MemorySessionStore, SessionStore};
    use crate::timestamp::{ManualClock, UnixTimestamp};
    use crate::token_vault::TokenVault;
    use crate::util::b64;
    use alloy::primitives::B256;
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::sync::Mutex;

    const T0: u64 = 1_700_000_000;
    const CREDENTIAL_ID: &str = "credential-1";
    const RECIPIENT: &str = "0x1111111111111111111111111111111111111111";
    const USDC_BASE: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";

    struct MockHttpClient {
        responses: Mutex<VecDeque<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl MockHttpClient {
        fn new(responses: Vec<HttpResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpClientError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| HttpClientError::Transport("no scripted response".into()))
        }
    }

    struct FailingHttpClient;

    #[async_trait]
    impl HttpClient for FailingHttpClient {
        async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse, HttpClientError> {
            Err(HttpClientError::Timeout)
        }
    }

    fn ok_response(body: &str) -> HttpResponse {
        HttpResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn challenge_response(reqs: serde_json::Value) -> HttpResponse {
        let body = serde_json::json!({ "paymentRequirements": reqs });
        let value = b64::encode(serde_json::to_vec(&body).unwrap());
        let mut headers = HeaderMap::new();
        headers.insert(
            PAYMENT_REQUIRED_HEADER,
            HeaderValue::from_str(&value).unwrap(),
        );
        HttpResponse {
            status: StatusCode::PAYMENT_REQUIRED,
            headers,
            body: Vec::new(),
        }
    }

    fn usdc_challenge() -> HttpResponse {
        challenge_response(serde_json::json!([{
            "scheme": "exact",
            "network": "base-mainnet",
            "maxAmountRequired": "1000000",
            "asset": USDC_BASE,
            "payTo": RECIPIENT
        }]))
    }

    fn settled_response(success: bool, tx_hash: Option<&str>) -> HttpResponse {
        let mut body = serde_json::json!({ "success": success, "network": "base-mainnet" });
        if let Some(hash) = tx_hash {
            body["transactionHash"] = hash.into();
        }
        if !success {
            body["error"] = "settlement reverted".into();
        }
        let value = b64::encode(serde_json::to_vec(&body).unwrap());
        let mut response = ok_response("paid content");
        response.headers.insert(
            PAYMENT_RESPONSE_HEADER,
            HeaderValue::from_str(&value).unwrap(),
        );
        response
    }

    struct Harness {
        engine: X402Engine,
        manager: Arc<SessionManager>,
        audit: Arc<AuditLog>,
        http: Arc<MockHttpClient>,
        session_key: KeyHash,
        clock: Arc<ManualClock>,
    }

    async fn harness_with(responses: Vec<HttpResponse>, policy: SessionPolicy) -> Harness {
        let clock = Arc::new(ManualClock::at(T0));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let vault = Arc::new(CredentialVault::new(Arc::new(HkdfKeyDerivation::new(
            [5u8; 32],
        ))));
        let tokens = Arc::new(TokenVault::new(store.clone(), clock.clone()));
        let manager = Arc::new(SessionManager::new(
            vault.clone(),
            store,
            tokens,
            clock.clone(),
        ));
        let master = MasterCredential {
            credential_id: CREDENTIAL_ID.to_string(),
            key_hash: KeyHash([0xaa; 32]),
            public_key: MasterPublicKey {
                x: B256::from([1u8; 32]),
                y: B256::from([2u8; 32]),
            },
        };
        let session = manager.create(&master, policy).await.unwrap();

        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        let alerts = Arc::new(AlertBus::with_defaults(clock.clone()));
        let http = Arc::new(MockHttpClient::new(responses));
        let engine = X402Engine::new(
            http.clone(),
            manager.clone(),
            AuthorizationSigner::new(vault, clock.clone()),
            Arc::new(FixedPriceOracle::new(1_000_000)),
            alerts,
            audit.clone(),
            EngineConfig::new(CREDENTIAL_ID),
        );
        Harness {
            engine,
            manager,
            audit,
            http,
            session_key: session.key_hash,
            clock,
        }
    }

    fn default_policy() -> SessionPolicy {
        SessionPolicy {
            daily_cap: UsdAmount::from_dollars(100),
            per_tx_cap: UsdAmount::from_dollars(25),
            expires_at: UnixTimestamp::from_secs(T0 + 3600),
            allowed_chains: vec![crate::network::chains::BASE],
        }
    }

    #[tokio::test]
    async fn test_non_402_passes_through() {
        let h = harness_with(vec![ok_response("hello")], default_policy()).await;
        let outcome = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap();
        match outcome {
            FetchOutcome::Passthrough(response) => {
                assert_eq!(response.status, StatusCode::OK);
                assert_eq!(response.body, b"hello");
            }
            other => panic!("expected passthrough, got {other:?}"),
        }
        assert_eq!(h.http.sent().len(), 1);
        assert!(h.audit.is_empty());
    }

    #[tokio::test]
    async fn test_402_happy_path() {
        let h = harness_with(
            vec![usdc_challenge(), settled_response(true, Some("0xabc123"))],
            default_policy(),
        )
        .await;

        let outcome = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap();

        let FetchOutcome::Paid { response, receipt } = outcome else {
            panic!("expected paid outcome");
        };
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(receipt.amount_usd, UsdAmount::from_dollars(1));
        assert_eq!(receipt.status, PaymentStatus::Confirmed);
        assert_eq!(receipt.tx_hash.as_deref(), Some("0xabc123"));
        assert!(receipt.audit_id.is_some());

        // The retry carried a decodable signature header.
        let sent = h.http.sent();
        assert_eq!(sent.len(), 2);
        let header = sent[1]
            .headers
            .get(PAYMENT_SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let payload = PaymentPayload::from_base64(&header).unwrap();
        assert_eq!(payload.network, "base-mainnet");
        let session = h.manager.load(&h.session_key).await.unwrap().unwrap();
        assert!(AuthorizationSigner::verify(
            &payload.payload.signature,
            &payload.payload.authorization,
            &session.derived_address().unwrap(),
            8453,
            &Address::from_str(USDC_BASE).unwrap(),
        ));

        // Ledger incremented by $1.00.
        assert_eq!(session.ledger.daily_spent, UsdAmount::from_dollars(1));
        assert_eq!(session.ledger.tx_count, 1);

        // One confirmed x402 audit record.
        let records = h.audit.query(&AuditFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PaymentStatus::Confirmed);
        assert_eq!(records[0].protocol, PaymentProtocol::X402);
        assert_eq!(records[0].recipient, RECIPIENT);
    }

    #[tokio::test]
    async fn test_402_denied_by_per_tx_cap() {
        // per-tx cap of $0.50 against a $1.00 challenge.
        let mut policy = default_policy();
        policy.per_tx_cap = UsdAmount::from_micros(500_000);
        let h = harness_with(vec![usdc_challenge()], policy).await;

        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::PerTxExceeded { .. })
        ));

        // No sign, no retry, no ledger change, no audit entry.
        assert_eq!(h.http.sent().len(), 1);
        let session = h.manager.load(&h.session_key).await.unwrap().unwrap();
        assert_eq!(session.ledger.daily_spent, UsdAmount::ZERO);
        assert_eq!(session.ledger.tx_count, 0);
        assert!(h.audit.is_empty());
    }

    #[tokio::test]
    async fn test_402_denied_on_disallowed_chain() {
        let challenge = challenge_response(serde_json::json!([{
            "scheme": "exact",
            "network": "ethereum-mainnet",
            "maxAmountRequired": "1000000",
            "asset": "USDC",
            "payTo": RECIPIENT
        }]));
        let h = harness_with(vec![challenge], default_policy()).await;
        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::ChainNotAllowed { chain_id: 1 })
        ));
        assert!(h.audit.is_empty());
    }

    #[tokio::test]
    async fn test_402_denied_when_session_expired() {
        let h = harness_with(vec![usdc_challenge()], default_policy()).await;
        h.clock.advance(3600);
        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Policy(PolicyError::Expired)));
    }

    #[tokio::test]
    async fn test_malformed_challenge() {
        let mut response = usdc_challenge();
        response.headers.insert(
            PAYMENT_REQUIRED_HEADER,
            HeaderValue::from_static("!!!not-base64!!!"),
        );
        let h = harness_with(vec![response], default_policy()).await;
        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol(ProtocolError::MalformedChallenge)
        ));
    }

    #[tokio::test]
    async fn test_second_402_is_payment_rejected() {
        let mut second = challenge_response(serde_json::json!([]));
        let body = serde_json::json!({
            "paymentRequirements": [],
            "error": "authorization expired"
        });
        let value = b64::encode(serde_json::to_vec(&body).unwrap());
        second.headers.insert(
            PAYMENT_REQUIRED_HEADER,
            HeaderValue::from_str(&value).unwrap(),
        );

        let h = harness_with(vec![usdc_challenge(), second], default_policy()).await;
        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap_err();
        match err {
            EngineError::Protocol(ProtocolError::PaymentRejected { server_reason }) => {
                assert_eq!(server_reason, "authorization expired");
            }
            other => panic!("expected PaymentRejected, got {other:?}"),
        }

        // The conservative contract: the increment recorded before the retry
        // stays, and the failure is audited.
        let session = h.manager.load(&h.session_key).await.unwrap().unwrap();
        assert_eq!(session.ledger.daily_spent, UsdAmount::from_dollars(1));
        let records = h.audit.query(&AuditFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_settlement_still_returns_response() {
        let h = harness_with(
            vec![usdc_challenge(), settled_response(false, None)],
            default_policy(),
        )
        .await;

        let outcome = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap();
        let FetchOutcome::Paid { response, receipt } = outcome else {
            panic!("expected paid outcome");
        };
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(receipt.status, PaymentStatus::Failed);
        assert!(receipt.settlement.is_some());
    }

    #[tokio::test]
    async fn test_ucp_handoff() {
        let mut response = usdc_challenge();
        response.headers.insert(
            UCP_INITIATION_HEADER,
            HeaderValue::from_static("https://ucp.example/init"),
        );
        let h = harness_with(vec![response], default_policy()).await;

        let outcome = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &h.session_key)
            .await
            .unwrap();
        match outcome {
            FetchOutcome::UcpHandoff { initiation_url, .. } => {
                assert_eq!(initiation_url, "https://ucp.example/init");
            }
            other => panic!("expected handoff, got {other:?}"),
        }
        // No signing and no spend happened.
        let session = h.manager.load(&h.session_key).await.unwrap().unwrap();
        assert_eq!(session.ledger.daily_spent, UsdAmount::ZERO);
    }

    #[tokio::test]
    async fn test_caller_headers_preserved_engine_header_wins() {
        let h = harness_with(
            vec![usdc_challenge(), settled_response(true, None)],
            default_policy(),
        )
        .await;

        let mut request = HttpRequest::get("https://api.example/feed");
        request
            .headers
            .insert("x-custom", HeaderValue::from_static("kept"));
        request.headers.insert(
            PAYMENT_SIGNATURE_HEADER,
            HeaderValue::from_static("stale-proof"),
        );

        h.engine
            .handle_fetch(request, &h.session_key)
            .await
            .unwrap();

        let sent = h.http.sent();
        let retry = &sent[1];
        assert_eq!(retry.headers.get("x-custom").unwrap(), "kept");
        let proof = retry
            .headers
            .get(PAYMENT_SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert_ne!(proof, "stale-proof");
        assert!(PaymentPayload::from_base64(proof).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_session_is_invalid() {
        let h = harness_with(vec![usdc_challenge()], default_policy()).await;
        let err = h
            .engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &KeyHash([9; 32]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::SessionInvalid)
        ));
    }

    #[tokio::test]
    async fn test_transport_timeout_maps_to_payment_timeout() {
        let clock = Arc::new(ManualClock::at(T0));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let vault = Arc::new(CredentialVault::new(Arc::new(HkdfKeyDerivation::new(
            [5u8; 32],
        ))));
        let tokens = Arc::new(TokenVault::new(store.clone(), clock.clone()));
        let manager = Arc::new(SessionManager::new(
            vault.clone(),
            store,
            tokens,
            clock.clone(),
        ));
        let engine = X402Engine::new(
            Arc::new(FailingHttpClient),
            manager,
            AuthorizationSigner::new(vault, clock.clone()),
            Arc::new(FixedPriceOracle::new(1_000_000)),
            Arc::new(AlertBus::with_defaults(clock.clone())),
            Arc::new(AuditLog::in_memory(clock.clone())),
            EngineConfig::new(CREDENTIAL_ID),
        );

        let err = engine
            .handle_fetch(HttpRequest::get("https://api.example/feed"), &KeyHash([1; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Transient(TransientError::Timeout)));
        assert_eq!(err.details().code, 4002);
        assert!(err.details().retryable);
    }
}
