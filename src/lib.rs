//! Autonomous-payment authorization core for software agents.
//!
//! A user delegates bounded signing authority to a short-lived *session key*
//! derived from a long-lived *master credential*; the agent then uses that
//! session to authorize stablecoin transfers on EVM-style chains, either by
//! explicit invocation or in response to an HTTP `402 Payment Required`
//! challenge.
//!
//! # Overview
//!
//! Four tightly coupled pieces own the security invariants:
//!
//! - **Session lifecycle & policy** — creation, encryption-at-rest, expiry,
//!   revocation, and hard enforcement of per-transaction and rolling-daily
//!   USD spend limits. See [`manager`], [`ledger`], [`credential`],
//!   [`store`].
//! - **402 negotiation** — intercept a 402 response, parse its requirements,
//!   apply policy, sign an authorization, retry with proof, interpret the
//!   settlement. See [`engine`] and [`parser`].
//! - **ERC-3009 signing** — EIP-712 `TransferWithAuthorization` construction
//!   with replay-safe nonces, verifiable out-of-band. See [`signer`].
//! - **Payment tokens** — tamper-evident, time-boxed capability tokens bound
//!   to a session, with revocation cascading from the session. See
//!   [`token_vault`].
//!
//! Spending alerts ([`alerts`]) and the append-only payment trail ([`audit`])
//! observe the flow; chain RPC, price discovery and persistent storage are
//! capabilities supplied by the embedding application.
//!
//! # Modules
//!
//! - [`alerts`] — spend-threshold latching, hysteresis, high-value approvals.
//! - [`audit`] — append-only payment records with filtered retrieval.
//! - [`credential`] — AES-256-GCM vault for session private keys.
//! - [`engine`] — the 402 negotiation state machine over an HTTP capability.
//! - [`error`] — error taxonomy and the stable user-visible error codes.
//! - [`ledger`] — pure check/record arithmetic over microdollar totals.
//! - [`manager`] — session lifecycle composition and per-session locking.
//! - [`network`] — chain registry and known stablecoin deployments.
//! - [`oracle`] — USD valuation seam with the stablecoin fast path.
//! - [`parser`] — `PAYMENT-REQUIRED` challenge parsing and normalization.
//! - [`proto`] — wire types for payment payloads, challenges, settlements.
//! - [`session`] — session data model and its persisted layout.
//! - [`signer`] — EIP-712 / ERC-3009 authorization signing and verification.
//! - [`store`] — durable session persistence (memory and file backed).
//! - [`timestamp`] — Unix timestamps and the wall-clock capability.
//! - [`token_vault`] — short-lived payment token minting and validation.
//! - [`usd`] — exact microdollar amounts.
//! - [`util`] — base64 codecs.

pub mod alerts;
pub mod audit;
pub mod credential;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod network;
pub mod oracle;
pub mod parser;
pub mod proto;
pub mod session;
pub mod signer;
pub mod store;
pub mod timestamp;
pub mod token_vault;
pub mod usd;
pub mod util;

pub use alerts::{Alert, AlertBus, AlertBusConfig, AlertSeverity, Approval};
pub use audit::{AuditFilter, AuditLog, PaymentProtocol, PaymentRecord, PaymentStatus};
pub use credential::{CredentialVault, HkdfKeyDerivation, MasterCredential, MasterKeyDerivation};
pub use engine::{
    EngineConfig, FetchOutcome, HttpClient, HttpRequest, HttpResponse, PaymentReceipt,
    ReqwestHttpClient, X402Engine,
};
pub use error::{EngineError, ErrorCode, ErrorDetails, PolicyError, ProtocolError, TransientError};
pub use ledger::{DenyReason, SpendDecision};
pub use manager::{SessionError, SessionManager};
pub use oracle::{FixedPriceOracle, PriceOracle};
pub use parser::{PaymentRequest, PaymentRequestParser, format_amount, parse_amount};
pub use session::{KeyHash, LedgerState, Session, SessionPolicy};
pub use signer::{AuthorizationSigner, SignedAuthorization};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use timestamp::{Clock, SystemClock, UnixTimestamp};
pub use token_vault::{PaymentToken, TokenRejection, TokenVault};
pub use usd::UsdAmount;
