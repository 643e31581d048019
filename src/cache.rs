//! AddressCache - process-local memoization over the ledger's resolution
//! tables (account <-> chain address, symbol -> instrument id).
//!
//! Not authoritative: may be empty on restart and is lazily repopulated on
//! miss. Per-process consistency only; no cross-process guarantee needed.

use crate::ledger::{LedgerError, LedgerReader};
use dashmap::DashMap;
use std::sync::Arc;

pub struct AddressCache {
    ledger: Arc<dyn LedgerReader>,
    address_by_account: DashMap<i64, String>,
    account_by_address: DashMap<String, i64>,
    instrument_by_symbol: DashMap<String, i32>,
}

impl AddressCache {
    pub fn new(ledger: Arc<dyn LedgerReader>) -> Self {
        Self {
            ledger,
            address_by_account: DashMap::new(),
            account_by_address: DashMap::new(),
            instrument_by_symbol: DashMap::new(),
        }
    }

    /// Chain address for an account; populates both directions on a miss.
    pub async fn address_of(&self, account_id: i64) -> Result<Option<String>, LedgerError> {
        if let Some(hit) = self.address_by_account.get(&account_id) {
            return Ok(Some(hit.clone()));
        }
        match self.ledger.account_address(account_id).await? {
            Some(address) => {
                self.address_by_account.insert(account_id, address.clone());
                self.account_by_address.insert(address.clone(), account_id);
                Ok(Some(address))
            }
            None => Ok(None),
        }
    }

    /// Account id behind a chain address.
    pub async fn account_of(&self, address: &str) -> Result<Option<i64>, LedgerError> {
        if let Some(hit) = self.account_by_address.get(address) {
            return Ok(Some(*hit));
        }
        match self.ledger.account_by_address(address).await? {
            Some(account_id) => {
                self.account_by_address.insert(address.to_string(), account_id);
                self.address_by_account.insert(account_id, address.to_string());
                Ok(Some(account_id))
            }
            None => Ok(None),
        }
    }

    /// On-chain instrument id for a symbol.
    pub async fn instrument_of(&self, symbol: &str) -> Result<Option<i32>, LedgerError> {
        if let Some(hit) = self.instrument_by_symbol.get(symbol) {
            return Ok(Some(*hit));
        }
        match self.ledger.instrument_id(symbol).await? {
            Some(id) => {
                self.instrument_by_symbol.insert(symbol.to_string(), id);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    pub fn cached_count(&self) -> usize {
        self.address_by_account.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemLedger;

    #[tokio::test]
    async fn test_lazy_populate_on_miss() {
        let ledger = Arc::new(MemLedger::new());
        ledger.add_account(1, "0xabc");
        ledger.add_instrument("BTC-PERP", 3);

        let cache = AddressCache::new(ledger.clone());
        assert_eq!(cache.cached_count(), 0);

        assert_eq!(cache.address_of(1).await.unwrap().as_deref(), Some("0xabc"));
        assert_eq!(cache.cached_count(), 1);

        // Reverse direction served from the same populate
        assert_eq!(cache.account_of("0xabc").await.unwrap(), Some(1));
        assert_eq!(cache.instrument_of("BTC-PERP").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_miss_is_not_cached() {
        let ledger = Arc::new(MemLedger::new());
        let cache = AddressCache::new(ledger.clone());

        assert_eq!(cache.address_of(42).await.unwrap(), None);

        // Account registered after the first miss must become visible
        ledger.add_account(42, "0xdef");
        assert_eq!(cache.address_of(42).await.unwrap().as_deref(), Some("0xdef"));
    }
}
