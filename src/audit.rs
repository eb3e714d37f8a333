//! Append-only audit log of payment attempts.
//!
//! Records are immutable once appended: there is no update or delete path.
//! The log keeps an in-memory view for queries and can mirror every append
//! to a JSONL file so the trail survives restarts. Losing an audit append is
//! a degraded-mode condition, never a reason to fail a payment that already
//! happened.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::RwLock;
use uuid::Uuid;

use crate::proto::TokenAmount;
use crate::session::KeyHash;
use crate::timestamp::{Clock, UnixTimestamp};
use crate::usd::UsdAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProtocol {
    X402,
    Ucp,
    Direct,
}

/// One payment attempt. `amount_smallest_unit` stays a decimal string in
/// every serialization so bigint values survive JSON round trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: String,
    pub timestamp: UnixTimestamp,
    pub session_key_hash: KeyHash,
    pub recipient: String,
    pub amount_smallest_unit: TokenAmount,
    #[serde(rename = "amountUSD")]
    pub amount_usd: UsdAmount,
    /// Token symbol or contract address, whichever the challenge carried.
    pub token: String,
    pub chain_id: u64,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub protocol: PaymentProtocol,
}

/// A record before the log assigns its id and timestamp.
#[derive(Debug, Clone)]
pub struct PaymentDraft {
    pub session_key_hash: KeyHash,
    pub recipient: String,
    pub amount_smallest_unit: TokenAmount,
    pub amount_usd: UsdAmount,
    pub token: String,
    pub chain_id: u64,
    pub status: PaymentStatus,
    pub tx_hash: Option<String>,
    pub protocol: PaymentProtocol,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Query filter. All clauses are conjunctive; time bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub chain_id: Option<u64>,
    pub session_key_hash: Option<KeyHash>,
    pub start_time: Option<UnixTimestamp>,
    pub end_time: Option<UnixTimestamp>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

const DEFAULT_QUERY_LIMIT: usize = 50;

/// The audit log itself.
pub struct AuditLog {
    records: RwLock<Vec<PaymentRecord>>,
    file: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            file: None,
            clock,
        }
    }

    /// Open a JSONL-backed log, loading any existing records so queries see
    /// the full trail after a restart. Unreadable lines are skipped with a
    /// warning; the trail itself is never rewritten.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let mut records = Vec::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<PaymentRecord>(line) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unreadable audit line");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            records: RwLock::new(records),
            file: Some(path),
            clock,
        })
    }

    /// Append a record: assigns a unique id, stamps the timestamp, appends
    /// durably when file-backed.
    #[tracing::instrument(skip_all, fields(key_hash = %draft.session_key_hash))]
    pub async fn log(&self, draft: PaymentDraft) -> Result<PaymentRecord, AuditError> {
        let record = PaymentRecord {
            id: Uuid::now_v7().to_string(),
            timestamp: self.clock.now(),
            session_key_hash: draft.session_key_hash,
            recipient: draft.recipient,
            amount_smallest_unit: draft.amount_smallest_unit,
            amount_usd: draft.amount_usd,
            token: draft.token,
            chain_id: draft.chain_id,
            status: draft.status,
            tx_hash: draft.tx_hash,
            protocol: draft.protocol,
        };

        if let Some(path) = &self.file {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
        }

        self.records
            .write()
            .expect("audit records poisoned")
            .push(record.clone());
        Ok(record)
    }

    /// Filtered retrieval, newest first. `limit` defaults to 50, `offset`
    /// to 0.
    pub fn query(&self, filter: &AuditFilter) -> Vec<PaymentRecord> {
        let records = self.records.read().expect("audit records poisoned");
        let mut matched: Vec<PaymentRecord> = records
            .iter()
            .filter(|r| filter.chain_id.is_none_or(|c| r.chain_id == c))
            .filter(|r| {
                filter
                    .session_key_hash
                    .is_none_or(|k| r.session_key_hash == k)
            })
            .filter(|r| filter.start_time.is_none_or(|t| r.timestamp >= t))
            .filter(|r| filter.end_time.is_none_or(|t| r.timestamp <= t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("audit records poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// JSON export. Bigint-valued fields stay decimal strings because that is
/// how the record types serialize.
pub fn export_json(records: &[PaymentRecord]) -> Result<String, AuditError> {
    Ok(serde_json::to_string_pretty(records)?)
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// CSV export; values containing commas are quoted.
pub fn export_csv(records: &[PaymentRecord]) -> String {
    let mut out = String::from(
        "id,timestamp,sessionKeyHash,recipient,amountSmallestUnit,amountUSD,token,chainId,status,txHash,protocol\n",
    );
    for r in records {
        let status = serde_json::to_value(r.status)
            .expect("status serializes")
            .as_str()
            .unwrap_or_default()
            .to_string();
        let protocol = serde_json::to_value(r.protocol)
            .expect("protocol serializes")
            .as_str()
            .unwrap_or_default()
            .to_string();
        let fields = [
            r.id.clone(),
            r.timestamp.to_string(),
            r.session_key_hash.to_string(),
            r.recipient.clone(),
            r.amount_smallest_unit.to_string(),
            r.amount_usd.to_string(),
            r.token.clone(),
            r.chain_id.to_string(),
            status,
            r.tx_hash.clone().unwrap_or_default(),
            protocol,
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::ManualClock;
    use alloy::primitives::U256;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000;

    fn draft(key: KeyHash, chain_id: u64) -> PaymentDraft {
        PaymentDraft {
            session_key_hash: key,
            recipient: "0x1111111111111111111111111111111111111111".to_string(),
            amount_smallest_unit: TokenAmount::from(1_000_000u64),
            amount_usd: UsdAmount::from_dollars(1),
            token: "USDC".to_string(),
            chain_id,
            status: PaymentStatus::Confirmed,
            tx_hash: Some("0xabc".to_string()),
            protocol: PaymentProtocol::X402,
        }
    }

    #[tokio::test]
    async fn test_log_assigns_id_and_timestamp() {
        let clock = Arc::new(ManualClock::at(T0));
        let log = AuditLog::in_memory(clock.clone());

        let a = log.log(draft(KeyHash([1; 32]), 30)).await.unwrap();
        clock.advance(5);
        let b = log.log(draft(KeyHash([1; 32]), 30)).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.timestamp.as_secs(), T0);
        assert_eq!(b.timestamp.as_secs(), T0 + 5);
    }

    #[tokio::test]
    async fn test_query_filters_and_sorts_descending() {
        let clock = Arc::new(ManualClock::at(T0));
        let log = AuditLog::in_memory(clock.clone());
        let key_a = KeyHash([1; 32]);
        let key_b = KeyHash([2; 32]);

        log.log(draft(key_a, 30)).await.unwrap();
        clock.advance(10);
        log.log(draft(key_b, 30)).await.unwrap();
        clock.advance(10);
        log.log(draft(key_a, 1)).await.unwrap();

        let all = log.query(&AuditFilter::default());
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp > all[1].timestamp);
        assert!(all[1].timestamp > all[2].timestamp);

        let by_session = log.query(&AuditFilter {
            session_key_hash: Some(key_a),
            ..Default::default()
        });
        assert_eq!(by_session.len(), 2);

        let by_chain = log.query(&AuditFilter {
            chain_id: Some(1),
            ..Default::default()
        });
        assert_eq!(by_chain.len(), 1);

        let by_window = log.query(&AuditFilter {
            start_time: Some(UnixTimestamp::from_secs(T0 + 5)),
            end_time: Some(UnixTimestamp::from_secs(T0 + 15)),
            ..Default::default()
        });
        assert_eq!(by_window.len(), 1);
    }

    #[tokio::test]
    async fn test_query_limit_and_offset() {
        let clock = Arc::new(ManualClock::at(T0));
        let log = AuditLog::in_memory(clock.clone());
        for _ in 0..5 {
            log.log(draft(KeyHash([1; 32]), 30)).await.unwrap();
            clock.advance(1);
        }

        let page = log.query(&AuditFilter {
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        });
        assert_eq!(page.len(), 2);
        // Newest-first: offset 1 skips the most recent record.
        assert_eq!(page[0].timestamp.as_secs(), T0 + 3);
    }

    #[tokio::test]
    async fn test_file_backed_log_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let clock = Arc::new(ManualClock::at(T0));

        {
            let log = AuditLog::open(&path, clock.clone()).await.unwrap();
            log.log(draft(KeyHash([1; 32]), 30)).await.unwrap();
            log.log(draft(KeyHash([1; 32]), 30)).await.unwrap();
        }

        let reopened = AuditLog::open(&path, clock).await.unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn test_json_export_preserves_bigints_as_strings() {
        let clock = Arc::new(ManualClock::at(T0));
        let log = AuditLog::in_memory(clock);
        let mut d = draft(KeyHash([1; 32]), 30);
        // A value far past u64 range must survive as a decimal string.
        d.amount_smallest_unit =
            TokenAmount(U256::from_str_radix("123456789012345678901234567890", 10).unwrap());
        log.log(d).await.unwrap();

        let json = export_json(&log.query(&AuditFilter::default())).unwrap();
        assert!(json.contains("\"123456789012345678901234567890\""));
    }

    #[tokio::test]
    async fn test_csv_export_quotes_commas() {
        let clock = Arc::new(ManualClock::at(T0));
        let log = AuditLog::in_memory(clock);
        let mut d = draft(KeyHash([1; 32]), 30);
        d.token = "USDC, bridged".to_string();
        log.log(d).await.unwrap();

        let csv = export_csv(&log.query(&AuditFilter::default()));
        assert!(csv.contains("\"USDC, bridged\""));
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,timestamp"));
        assert_eq!(lines.count(), 1);
    }
}
