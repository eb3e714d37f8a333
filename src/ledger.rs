//! Spending-limit arithmetic.
//!
//! `check` and `record` are pure functions over a session's [`LedgerState`];
//! committing the updated state back to the store is the session manager's
//! job. All quantities are integer microdollars; there is no floating point
//! on any path here.

use crate::session::{LedgerState, SessionPolicy};
use crate::timestamp::{SECONDS_PER_DAY, UnixTimestamp};
use crate::usd::UsdAmount;
use std::fmt;
use std::fmt::Display;

/// Why a proposed spend was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Expired,
    PerTransactionLimit,
    DailyLimit,
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DenyReason::Expired => "expired",
            DenyReason::PerTransactionLimit => "per-transaction limit",
            DenyReason::DailyLimit => "daily limit",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a limit check. `remaining` is the headroom left in the daily
/// window (after the spend, when allowed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendDecision {
    Allow {
        remaining: UsdAmount,
    },
    Deny {
        reason: DenyReason,
        remaining: UsdAmount,
    },
}

impl SpendDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SpendDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// `record` was called for an amount `check` would not have allowed.
    #[error("recorded spend was not allowed: {reason}")]
    NotAllowed {
        reason: DenyReason,
        remaining: UsdAmount,
    },
    /// Running totals would overflow; only possible with corrupted state.
    #[error("ledger totals overflow")]
    Overflow,
}

/// Roll the 24 h window forward if it has elapsed.
///
/// Any read that feeds a limit decision must pass through here first, so a
/// stale window can never deny (or allow) a spend.
pub fn advance_window(ledger: &mut LedgerState, now: UnixTimestamp) {
    if now >= ledger.daily_reset_at {
        ledger.daily_spent = UsdAmount::ZERO;
        ledger.daily_reset_at = now + SECONDS_PER_DAY;
    }
}

/// Decide whether `amount` may be spent at `now`.
///
/// Order of refusal: expiry, per-transaction cap, daily cap. The window is
/// advanced before any comparison.
pub fn check(
    policy: &SessionPolicy,
    ledger: &mut LedgerState,
    amount: UsdAmount,
    now: UnixTimestamp,
) -> SpendDecision {
    advance_window(ledger, now);

    if now >= policy.expires_at {
        return SpendDecision::Deny {
            reason: DenyReason::Expired,
            remaining: UsdAmount::ZERO,
        };
    }

    let remaining = policy.daily_cap.saturating_sub(ledger.daily_spent);

    if amount > policy.per_tx_cap {
        return SpendDecision::Deny {
            reason: DenyReason::PerTransactionLimit,
            remaining,
        };
    }

    match ledger.daily_spent.checked_add(amount) {
        Some(new_daily) if new_daily <= policy.daily_cap => SpendDecision::Allow {
            remaining: policy.daily_cap.saturating_sub(new_daily),
        },
        _ => SpendDecision::Deny {
            reason: DenyReason::DailyLimit,
            remaining,
        },
    }
}

/// Apply an allowed spend to the ledger.
///
/// Re-runs `check` first so a caller race can never push `daily_spent` past
/// the cap; the updated fields are `daily_spent`, `total_spent`, `tx_count`
/// and `last_used_at`, in that order.
pub fn record(
    policy: &SessionPolicy,
    ledger: &mut LedgerState,
    amount: UsdAmount,
    now: UnixTimestamp,
) -> Result<UsdAmount, LedgerError> {
    match check(policy, ledger, amount, now) {
        SpendDecision::Allow { remaining } => {
            ledger.daily_spent = ledger
                .daily_spent
                .checked_add(amount)
                .ok_or(LedgerError::Overflow)?;
            ledger.total_spent = ledger
                .total_spent
                .checked_add(amount)
                .ok_or(LedgerError::Overflow)?;
            ledger.tx_count += 1;
            ledger.last_used_at = now;
            Ok(remaining)
        }
        SpendDecision::Deny { reason, remaining } => {
            Err(LedgerError::NotAllowed { reason, remaining })
        }
    }
}
