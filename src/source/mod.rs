//! Upstream event source: ordered matching-engine output with stable
//! offsets, consumed at-least-once. Reprocessing an offset range is safe
//! because the translator's inserts are idempotent; the offset cursor is
//! committed only after a batch has been durably persisted.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::sync::Mutex;
use thiserror::Error;

use crate::action::types::Side;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Undecodable event at offset {offset}: {reason}")]
    Decode { offset: i64, reason: String },
}

/// One leg of a trade as delivered by the matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLeg {
    pub leg_id: i64,
    pub account_id: i64,
    pub side: Side,
    pub fee: Decimal,
    pub fee_rate: Decimal,
    /// Contract-margin value recorded by the ledger for this leg
    pub margin: Decimal,
    pub liquidation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    pub trade_id: i64,
    pub symbol: String,
    pub price: Decimal,
    pub qty: Decimal,
    pub buy: TradeLeg,
    pub sell: TradeLeg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub withdrawal_id: i64,
    pub account_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub funding_id: i64,
    pub account_id: i64,
    pub symbol: String,
    /// Signed: positive credits the account, negative debits it
    pub amount: Decimal,
}

/// Matching-engine output, in delivery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Trades(Vec<TradeFill>),
    WithdrawalApproved(Withdrawal),
    FundingPayments(Vec<FundingPayment>),
}

#[derive(Debug, Clone)]
pub struct SourceEnvelope {
    pub offset: i64,
    pub event: DomainEvent,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Deliver the next events after the committed cursor, in source order.
    async fn poll(&self, limit: i64) -> Result<Vec<SourceEnvelope>, SourceError>;

    /// Advance the cursor past `offset`. Only called after the batch for
    /// that offset is durably persisted.
    async fn commit(&self, offset: i64) -> Result<(), SourceError>;
}

const SOURCE_CURSOR: &str = "source-offset";

/// Postgres outbox reader; the consumer cursor lives in the checkpoint table.
pub struct PgOutboxSource {
    pool: PgPool,
}

impl PgOutboxSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn cursor(&self) -> Result<i64, SourceError> {
        let row = sqlx::query("SELECT position FROM settlement_checkpoints_tb WHERE name = $1")
            .bind(SOURCE_CURSOR)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("position")).unwrap_or(0))
    }
}

#[async_trait]
impl EventSource for PgOutboxSource {
    async fn poll(&self, limit: i64) -> Result<Vec<SourceEnvelope>, SourceError> {
        let after = self.cursor().await?;
        let rows = sqlx::query(
            "SELECT id, payload FROM settlement_outbox_tb WHERE id > $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let offset: i64 = row.get("id");
            let payload: serde_json::Value = row.get("payload");
            let event =
                serde_json::from_value(payload).map_err(|e| SourceError::Decode {
                    offset,
                    reason: e.to_string(),
                })?;
            out.push(SourceEnvelope { offset, event });
        }
        Ok(out)
    }

    async fn commit(&self, offset: i64) -> Result<(), SourceError> {
        sqlx::query(
            r#"INSERT INTO settlement_checkpoints_tb (name, position)
               VALUES ($1, $2)
               ON CONFLICT (name) DO UPDATE
               SET position = EXCLUDED.position, updated_at = NOW()
               WHERE settlement_checkpoints_tb.position < EXCLUDED.position"#,
        )
        .bind(SOURCE_CURSOR)
        .bind(offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory source for tests. Uncommitted envelopes are re-delivered on
/// every poll, which is exactly the upstream's at-least-once behavior.
#[derive(Default)]
pub struct MemEventSource {
    inner: Mutex<MemSourceInner>,
}

#[derive(Default)]
struct MemSourceInner {
    envelopes: Vec<SourceEnvelope>,
    committed: i64,
}

impl MemEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: DomainEvent) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let offset = inner.envelopes.last().map(|e| e.offset).unwrap_or(0) + 1;
        inner.envelopes.push(SourceEnvelope { offset, event });
        offset
    }

    pub fn committed(&self) -> i64 {
        self.inner.lock().unwrap().committed
    }
}

#[async_trait]
impl EventSource for MemEventSource {
    async fn poll(&self, limit: i64) -> Result<Vec<SourceEnvelope>, SourceError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .envelopes
            .iter()
            .filter(|e| e.offset > inner.committed)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn commit(&self, offset: i64) -> Result<(), SourceError> {
        let mut inner = self.inner.lock().unwrap();
        if offset > inner.committed {
            inner.committed = offset;
        }
        Ok(())
    }
}
