//! Action translator: turns matching-engine events into pending settlement
//! actions.
//!
//! A poll batch is translated as a whole. Any unresolved cross-reference
//! fails the batch before anything is inserted and leaves the source cursor
//! where it was, so the batch is re-delivered once the ledger catches up.
//! Inserts are idempotent on (kind, source_id), which makes re-delivery
//! after a crash between insert and commit harmless.

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::action::store::{SettlementStore, StoreError};
use crate::action::types::{ActionKind, NewAction, SettlementParams, Side};
use crate::cache::AddressCache;
use crate::config::{PipelineConfig, SourceConfig};
use crate::ledger::LedgerError;
use crate::scale::{ScaleError, to_fixed};
use crate::source::{
    DomainEvent, EventSource, FundingPayment, SourceError, TradeFill, TradeLeg, Withdrawal,
};

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scale error: {0}")]
    Scale(#[from] ScaleError),

    #[error("No chain address registered for account {account_id} (offset {offset})")]
    UnresolvedAccount { account_id: i64, offset: i64 },

    #[error("No instrument registered for symbol {symbol:?} (offset {offset})")]
    UnresolvedSymbol { symbol: String, offset: i64 },
}

pub struct ActionTranslator {
    store: Arc<dyn SettlementStore>,
    source: Arc<dyn EventSource>,
    cache: Arc<AddressCache>,
    margin_scale: u32,
    withdraw_scale: u32,
    poll_batch: i64,
    poll_interval: Duration,
}

impl ActionTranslator {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        source: Arc<dyn EventSource>,
        cache: Arc<AddressCache>,
        pipeline: &PipelineConfig,
        source_cfg: &SourceConfig,
    ) -> Self {
        Self {
            store,
            source,
            cache,
            margin_scale: pipeline.margin_scale,
            withdraw_scale: pipeline.withdraw_scale,
            poll_batch: source_cfg.batch,
            poll_interval: Duration::from_millis(source_cfg.poll_interval_ms),
        }
    }

    pub async fn run(&self) {
        info!("Action translator started");
        loop {
            match self.step().await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(n) => debug!("Translated {} settlement actions", n),
                Err(e) => {
                    // Unresolved references clear themselves once the ledger
                    // registers the missing row; everything else is transient
                    error!("Translation batch failed, will retry: {}", e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Translate one poll batch. Returns the number of actions produced,
    /// zero when the source had nothing new.
    pub async fn step(&self) -> Result<usize, TranslateError> {
        let envelopes = self.source.poll(self.poll_batch).await?;
        let Some(last) = envelopes.last().map(|e| e.offset) else {
            return Ok(0);
        };

        let mut actions = Vec::new();
        for envelope in &envelopes {
            match &envelope.event {
                DomainEvent::Trades(fills) => {
                    for fill in fills {
                        self.translate_fill(fill, envelope.offset, &mut actions)
                            .await?;
                    }
                }
                DomainEvent::WithdrawalApproved(withdrawal) => {
                    actions.push(self.translate_withdrawal(withdrawal, envelope.offset).await?);
                }
                DomainEvent::FundingPayments(payments) => {
                    for payment in payments {
                        actions.push(self.translate_funding(payment, envelope.offset).await?);
                    }
                }
            }
        }

        let inserted = self.store.insert_actions(&actions).await?;
        if inserted < actions.len() as u64 {
            debug!(
                "Dropped {} re-delivered actions",
                actions.len() as u64 - inserted
            );
        }
        self.source.commit(last).await?;
        Ok(actions.len())
    }

    async fn resolve_address(&self, account_id: i64, offset: i64) -> Result<String, TranslateError> {
        self.cache
            .address_of(account_id)
            .await?
            .ok_or(TranslateError::UnresolvedAccount { account_id, offset })
    }

    async fn resolve_instrument(&self, symbol: &str, offset: i64) -> Result<i32, TranslateError> {
        self.cache
            .instrument_of(symbol)
            .await?
            .ok_or_else(|| TranslateError::UnresolvedSymbol {
                symbol: symbol.to_string(),
                offset,
            })
    }

    /// One action per leg; the leg id is the idempotency key.
    async fn translate_fill(
        &self,
        fill: &TradeFill,
        offset: i64,
        out: &mut Vec<NewAction>,
    ) -> Result<(), TranslateError> {
        let instrument_id = self.resolve_instrument(&fill.symbol, offset).await?;
        for leg in [&fill.buy, &fill.sell] {
            let address = self.resolve_address(leg.account_id, offset).await?;
            let bankrupt_price_fp = match bankrupt_price(fill, leg) {
                Some(price) => Some(to_fixed(price, self.margin_scale)?),
                None => None,
            };
            out.push(NewAction {
                kind: ActionKind::Trade,
                source_id: leg.leg_id,
                source_offset: offset,
                raw_payload: serde_json::to_value(fill).unwrap_or_default(),
                params: SettlementParams::Trade {
                    account_id: leg.account_id,
                    address,
                    instrument_id,
                    side: leg.side,
                    price_fp: to_fixed(fill.price, self.margin_scale)?,
                    qty_fp: to_fixed(fill.qty, self.margin_scale)?,
                    fee_fp: to_fixed(leg.fee, self.margin_scale)?,
                    margin_fp: to_fixed(leg.margin, self.margin_scale)?,
                    bankrupt_price_fp,
                    op_id: Uuid::new_v4(),
                },
            });
        }
        Ok(())
    }

    async fn translate_withdrawal(
        &self,
        withdrawal: &Withdrawal,
        offset: i64,
    ) -> Result<NewAction, TranslateError> {
        let address = self.resolve_address(withdrawal.account_id, offset).await?;
        Ok(NewAction {
            kind: ActionKind::Withdraw,
            source_id: withdrawal.withdrawal_id,
            source_offset: offset,
            raw_payload: serde_json::to_value(withdrawal).unwrap_or_default(),
            params: SettlementParams::Withdraw {
                account_id: withdrawal.account_id,
                address,
                amount_fp: to_fixed(withdrawal.amount, self.withdraw_scale)?,
                op_id: Uuid::new_v4(),
            },
        })
    }

    async fn translate_funding(
        &self,
        payment: &FundingPayment,
        offset: i64,
    ) -> Result<NewAction, TranslateError> {
        let address = self.resolve_address(payment.account_id, offset).await?;
        let instrument_id = self.resolve_instrument(&payment.symbol, offset).await?;
        Ok(NewAction {
            kind: ActionKind::Funding,
            source_id: payment.funding_id,
            source_offset: offset,
            raw_payload: serde_json::to_value(payment).unwrap_or_default(),
            params: SettlementParams::Funding {
                account_id: payment.account_id,
                address,
                instrument_id,
                amount_fp: to_fixed(payment.amount, self.margin_scale)?,
                op_id: Uuid::new_v4(),
            },
        })
    }
}

/// Bankrupt price of a liquidated leg: the fill price pushed through the
/// taker fee in the direction that wipes the position out. A long is
/// bankrupt below the fill, a short above it.
fn bankrupt_price(fill: &TradeFill, leg: &TradeLeg) -> Option<Decimal> {
    if !leg.liquidation {
        return None;
    }
    let factor = match leg.side {
        Side::Buy => Decimal::ONE - leg.fee_rate,
        Side::Sell => Decimal::ONE + leg.fee_rate,
    };
    Some(fill.price * factor)
}
