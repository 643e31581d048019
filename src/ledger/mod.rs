//! Read-only access to the trading ledger.
//!
//! The settlement pipeline never writes these tables; it resolves
//! cross-references during translation and looks up the authoritative
//! records during reconciliation.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Chain address for an account, if registered.
    async fn account_address(&self, account_id: i64) -> Result<Option<String>, LedgerError>;

    /// Reverse lookup: account id behind a chain address.
    async fn account_by_address(&self, address: &str) -> Result<Option<i64>, LedgerError>;

    /// On-chain instrument id for a symbol.
    async fn instrument_id(&self, symbol: &str) -> Result<Option<i32>, LedgerError>;

    /// Recorded contract-margin value of one trade leg.
    async fn trade_leg_margin(&self, leg_id: i64) -> Result<Option<Decimal>, LedgerError>;

    /// Amount of one withdrawal transaction.
    async fn withdrawal_amount(&self, withdrawal_id: i64) -> Result<Option<Decimal>, LedgerError>;

    /// Signed amount of one funding-history entry.
    async fn funding_amount(&self, funding_id: i64) -> Result<Option<Decimal>, LedgerError>;
}

/// Postgres-backed ledger reader, scoped to one chain's address book.
pub struct PgLedger {
    pool: PgPool,
    chain: String,
}

impl PgLedger {
    pub fn new(pool: PgPool, chain: impl Into<String>) -> Self {
        Self {
            pool,
            chain: chain.into(),
        }
    }
}

#[async_trait]
impl LedgerReader for PgLedger {
    async fn account_address(&self, account_id: i64) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query(
            "SELECT address FROM account_addresses_tb WHERE account_id = $1 AND chain = $2",
        )
        .bind(account_id)
        .bind(&self.chain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("address")))
    }

    async fn account_by_address(&self, address: &str) -> Result<Option<i64>, LedgerError> {
        let row = sqlx::query(
            "SELECT account_id FROM account_addresses_tb WHERE chain = $1 AND address = $2",
        )
        .bind(&self.chain)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("account_id")))
    }

    async fn instrument_id(&self, symbol: &str) -> Result<Option<i32>, LedgerError> {
        let row = sqlx::query("SELECT instrument_id FROM instruments_tb WHERE symbol = $1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("instrument_id")))
    }

    async fn trade_leg_margin(&self, leg_id: i64) -> Result<Option<Decimal>, LedgerError> {
        let row = sqlx::query("SELECT contract_margin FROM trade_margin_history_tb WHERE leg_id = $1")
            .bind(leg_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("contract_margin")))
    }

    async fn withdrawal_amount(&self, withdrawal_id: i64) -> Result<Option<Decimal>, LedgerError> {
        let row = sqlx::query("SELECT amount FROM withdraw_history_tb WHERE withdrawal_id = $1")
            .bind(withdrawal_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("amount")))
    }

    async fn funding_amount(&self, funding_id: i64) -> Result<Option<Decimal>, LedgerError> {
        let row = sqlx::query("SELECT amount FROM funding_history_tb WHERE funding_id = $1")
            .bind(funding_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("amount")))
    }
}

/// In-memory ledger for tests.
#[derive(Default)]
pub struct MemLedger {
    inner: Mutex<MemLedgerInner>,
}

#[derive(Default)]
struct MemLedgerInner {
    addresses: HashMap<i64, String>,
    instruments: HashMap<String, i32>,
    trade_margins: HashMap<i64, Decimal>,
    withdrawals: HashMap<i64, Decimal>,
    fundings: HashMap<i64, Decimal>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account_id: i64, address: &str) {
        self.inner
            .lock()
            .unwrap()
            .addresses
            .insert(account_id, address.to_string());
    }

    pub fn add_instrument(&self, symbol: &str, instrument_id: i32) {
        self.inner
            .lock()
            .unwrap()
            .instruments
            .insert(symbol.to_string(), instrument_id);
    }

    pub fn add_trade_margin(&self, leg_id: i64, margin: Decimal) {
        self.inner.lock().unwrap().trade_margins.insert(leg_id, margin);
    }

    pub fn add_withdrawal(&self, withdrawal_id: i64, amount: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .withdrawals
            .insert(withdrawal_id, amount);
    }

    pub fn add_funding(&self, funding_id: i64, amount: Decimal) {
        self.inner.lock().unwrap().fundings.insert(funding_id, amount);
    }
}

#[async_trait]
impl LedgerReader for MemLedger {
    async fn account_address(&self, account_id: i64) -> Result<Option<String>, LedgerError> {
        Ok(self.inner.lock().unwrap().addresses.get(&account_id).cloned())
    }

    async fn account_by_address(&self, address: &str) -> Result<Option<i64>, LedgerError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .addresses
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(id, _)| *id))
    }

    async fn instrument_id(&self, symbol: &str) -> Result<Option<i32>, LedgerError> {
        Ok(self.inner.lock().unwrap().instruments.get(symbol).copied())
    }

    async fn trade_leg_margin(&self, leg_id: i64) -> Result<Option<Decimal>, LedgerError> {
        Ok(self.inner.lock().unwrap().trade_margins.get(&leg_id).copied())
    }

    async fn withdrawal_amount(&self, withdrawal_id: i64) -> Result<Option<Decimal>, LedgerError> {
        Ok(self.inner.lock().unwrap().withdrawals.get(&withdrawal_id).copied())
    }

    async fn funding_amount(&self, funding_id: i64) -> Result<Option<Decimal>, LedgerError> {
        Ok(self.inner.lock().unwrap().fundings.get(&funding_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_mem_ledger_lookups() {
        let ledger = MemLedger::new();
        ledger.add_account(7, "0xaaa");
        ledger.add_instrument("BTC-PERP", 1);
        ledger.add_trade_margin(100, Decimal::from_str("100.000000").unwrap());

        assert_eq!(ledger.account_address(7).await.unwrap().as_deref(), Some("0xaaa"));
        assert_eq!(ledger.account_by_address("0xaaa").await.unwrap(), Some(7));
        assert_eq!(ledger.instrument_id("BTC-PERP").await.unwrap(), Some(1));
        assert_eq!(ledger.instrument_id("ETH-PERP").await.unwrap(), None);
        assert!(ledger.trade_leg_margin(100).await.unwrap().is_some());
        assert!(ledger.withdrawal_amount(1).await.unwrap().is_none());
    }
}
