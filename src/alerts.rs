//! Spending alerts, threshold latching and high-value approvals.
//!
//! The bus watches the ratio of daily spend to the daily cap and fires each
//! configured threshold exactly once per upward crossing. A fired threshold
//! stays latched until the ratio drops below 10% of the cap (the hysteresis
//! reset, typically a window rollover), which re-arms everything. Ratio math
//! is integer basis points; no floating point touches spend figures.
//!
//! High-value payments get a short-lived approval window: a single
//! approve/deny decision, evicted on expiry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::session::KeyHash;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::usd::UsdAmount;

/// Default alert thresholds, in basis points of the daily cap.
pub const DEFAULT_THRESHOLDS_BPS: [u32; 4] = [5_000, 8_000, 9_000, 10_000];

/// Thresholds at or above this level fire as critical.
const CRITICAL_BPS: u32 = 9_000;

/// Latches re-arm when the spend ratio falls below this level.
const HYSTERESIS_RESET_BPS: u32 = 1_000;

/// Approval requests expire after this many seconds.
pub const APPROVAL_TTL: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub reason: String,
    pub session_key_hash: KeyHash,
    #[serde(rename = "dailySpentUSD")]
    pub daily_spent: UsdAmount,
    #[serde(rename = "dailyCapUSD")]
    pub daily_cap: UsdAmount,
    pub timestamp: UnixTimestamp,
}

/// A pending (or granted) high-value approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    pub transaction_id: String,
    pub amount_usd: UsdAmount,
    pub requested_at: UnixTimestamp,
    pub expires_at: UnixTimestamp,
    pub approved: bool,
    pub approved_by: Option<String>,
}

/// Read-only approval state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalStatus {
    pub approved: bool,
    pub expired: bool,
}

type Subscriber = Box<dyn Fn(&Alert) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AlertBusConfig {
    pub thresholds_bps: Vec<u32>,
    pub high_value_threshold: UsdAmount,
    pub approval_ttl: u64,
}

impl Default for AlertBusConfig {
    fn default() -> Self {
        Self {
            thresholds_bps: DEFAULT_THRESHOLDS_BPS.to_vec(),
            high_value_threshold: UsdAmount::from_dollars(1000),
            approval_ttl: APPROVAL_TTL,
        }
    }
}

/// Threshold tracker with subscriber fan-out.
pub struct AlertBus {
    config: AlertBusConfig,
    clock: Arc<dyn Clock>,
    latches: Mutex<HashMap<KeyHash, BTreeSet<u32>>>,
    approvals: Mutex<HashMap<String, Approval>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl AlertBus {
    pub fn new(config: AlertBusConfig, clock: Arc<dyn Clock>) -> Self {
        let mut config = config;
        config.thresholds_bps.sort_unstable();
        Self {
            config,
            clock,
            latches: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(AlertBusConfig::default(), clock)
    }

    /// Register a subscriber. Delivery is synchronous and best-effort.
    pub fn subscribe<F: Fn(&Alert) + Send + Sync + 'static>(&self, f: F) {
        self.subscribers
            .write()
            .expect("subscribers poisoned")
            .push(Box::new(f));
    }

    fn emit(&self, alert: &Alert) {
        let subscribers = self.subscribers.read().expect("subscribers poisoned");
        for subscriber in subscribers.iter() {
            subscriber(alert);
        }
    }

    /// Feed a spend update. Fires every unlatched threshold the ratio has
    /// crossed, latching each; a ratio below 10% clears all latches for the
    /// session. Returns the alerts fired.
    pub fn on_spending(
        &self,
        session_key_hash: &KeyHash,
        daily_spent: UsdAmount,
        daily_cap: UsdAmount,
    ) -> Vec<Alert> {
        if daily_cap.is_zero() {
            return Vec::new();
        }
        let ratio_bps =
            (daily_spent.as_micros() as u128 * 10_000 / daily_cap.as_micros() as u128) as u32;

        let mut fired = Vec::new();
        {
            let mut latches = self.latches.lock().expect("latches poisoned");

            if ratio_bps < HYSTERESIS_RESET_BPS {
                // The only reset path: a rollover (or refund) dropped the
                // ratio far enough to re-arm everything.
                latches.remove(session_key_hash);
                return Vec::new();
            }

            let session_latches = latches.entry(*session_key_hash).or_default();
            for &threshold in &self.config.thresholds_bps {
                if ratio_bps >= threshold && session_latches.insert(threshold) {
                    let severity = if threshold >= CRITICAL_BPS {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::Warning
                    };
                    fired.push(Alert {
                        severity,
                        reason: format!(
                            "daily spend reached {}% of the daily cap",
                            threshold / 100
                        ),
                        session_key_hash: *session_key_hash,
                        daily_spent,
                        daily_cap,
                        timestamp: self.clock.now(),
                    });
                }
            }
        }

        for alert in &fired {
            tracing::warn!(
                severity = ?alert.severity,
                key_hash = %alert.session_key_hash,
                "{}",
                alert.reason
            );
            self.emit(alert);
        }
        fired
    }

    /// Whether an amount is large enough to require an approval window.
    pub fn is_high_value(&self, amount: UsdAmount) -> bool {
        amount >= self.config.high_value_threshold
    }

    /// Open an approval window for a high-value payment and emit a critical
    /// alert. The window expires after the configured TTL.
    pub fn request_approval(
        &self,
        transaction_id: &str,
        amount_usd: UsdAmount,
        session_key_hash: &KeyHash,
    ) -> Approval {
        let now = self.clock.now();
        let approval = Approval {
            transaction_id: transaction_id.to_string(),
            amount_usd,
            requested_at: now,
            expires_at: now + self.config.approval_ttl,
            approved: false,
            approved_by: None,
        };
        self.approvals
            .lock()
            .expect("approvals poisoned")
            .insert(transaction_id.to_string(), approval.clone());

        let alert = Alert {
            severity: AlertSeverity::Critical,
            reason: format!(
                "high-value payment of {} USD awaiting approval (tx {})",
                amount_usd, transaction_id
            ),
            session_key_hash: *session_key_hash,
            daily_spent: amount_usd,
            daily_cap: self.config.high_value_threshold,
            timestamp: now,
        };
        self.emit(&alert);
        approval
    }

    /// Grant a pending approval. Succeeds only while the window is open;
    /// stale approvals are evicted.
    pub fn approve(&self, transaction_id: &str, approver_key: &str) -> bool {
        let now = self.clock.now();
        let mut approvals = self.approvals.lock().expect("approvals poisoned");
        match approvals.get_mut(transaction_id) {
            Some(approval) if now < approval.expires_at => {
                approval.approved = true;
                approval.approved_by = Some(approver_key.to_string());
                true
            }
            Some(_) => {
                approvals.remove(transaction_id);
                false
            }
            None => false,
        }
    }

    /// Read approval state without granting. Expired entries are evicted and
    /// reported as such.
    pub fn check_approval(&self, transaction_id: &str) -> Option<ApprovalStatus> {
        let now = self.clock.now();
        let mut approvals = self.approvals.lock().expect("approvals poisoned");
        let approval = approvals.get(transaction_id)?;
        if now >= approval.expires_at {
            let approved = approval.approved;
            approvals.remove(transaction_id);
            return Some(ApprovalStatus {
                approved,
                expired: true,
            });
        }
        Some(ApprovalStatus {
            approved: approval.approved,
            expired: false,
        })
    }
}
