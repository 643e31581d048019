//! Chain access seams.
//!
//! The pipeline speaks to a chain through three narrow interfaces:
//! [`ChainRpc`] (broadcast / receipts / sequencing / event queries),
//! [`TxCodec`] (pack a batch of actions into one unsigned transaction) and
//! [`TxSigner`] (opaque key custody). `evm.rs` and `sol.rs` implement the
//! two real chains; [`MockChainRpc`] scripts chain state for tests.

pub mod evm;
pub mod signer;
pub mod sol;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::action::types::{ActionKind, PendingAction};

pub use signer::{MockSigner, SignError, SignedTx, TxSigner, UnsignedTx};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport failed: {0}")]
    Transport(String),

    #[error("RPC rejected request: {0}")]
    Rejected(String),

    #[error("Undecodable chain data: {0}")]
    Decode(String),
}

/// Confirmed execution outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub success: bool,
}

/// One decoded settlement event emitted by the contract, margins still in
/// chain fixed-point.
#[derive(Debug, Clone)]
pub struct SettlementEvent {
    pub chain_tx_id: String,
    pub log_index: i32,
    pub actor: String,
    pub kind: ActionKind,
    pub action_id: i64,
    pub op_id: String,
    pub margin_before_fp: i128,
    pub margin_after_fp: i128,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Chain identifier (e.g., "EVM", "SOL")
    fn chain_id(&self) -> &str;

    /// Broadcast raw signed bytes; returns the chain's transaction id.
    /// Broadcasting an already-landed transaction is a no-op on the chain.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, RpcError>;

    /// Receipt for a transaction, or None while unconfirmed.
    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError>;

    /// Next sequencing value the chain expects from this signer
    /// (account nonce, or the current slot on the alternate chain).
    async fn next_sequencing_value(&self, signer: &str) -> Result<u64, RpcError>;

    /// Current chain head (block height or slot).
    async fn head(&self) -> Result<u64, RpcError>;

    /// All settlement events in the inclusive height/slot window.
    async fn settlement_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<SettlementEvent>, RpcError>;
}

/// Process-local cache of the signer's next counter value on
/// counter-sequencing chains. The submitter is its only writer in normal
/// operation; anything that consumes a sequencing value behind its back
/// (a re-sign) resets it so the next read goes back to the chain.
#[derive(Default)]
pub struct SequencingCounter {
    next: tokio::sync::Mutex<Option<u64>>,
}

impl SequencingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cached(&self) -> Option<u64> {
        *self.next.lock().await
    }

    pub async fn set(&self, next: u64) {
        *self.next.lock().await = Some(next);
    }

    /// Forget the cached value; the next reader re-fetches from the chain.
    pub async fn reset(&self) {
        *self.next.lock().await = None;
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encoded transaction is {size} bytes, over the {ceiling}-byte ceiling")]
    Oversize { size: usize, ceiling: usize },

    #[error("unencodable action: {0}")]
    Unencodable(String),
}

/// Packs a batch of translated actions into one unsigned transaction
/// payload for its chain.
pub trait TxCodec: Send + Sync {
    /// True when the chain uses a per-signer monotonic counter that the
    /// submitter must advance locally (EVM nonce). False for chains whose
    /// sequencing value is fetched fresh each time (slot/blockhash).
    fn counter_sequencing(&self) -> bool;

    fn encode_batch(
        &self,
        actions: &[PendingAction],
        sequencing: u64,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Scripted chain for tests: receipts, head, sequencing and events are set
/// by the test; every broadcast is recorded so resend behavior is checkable.
#[derive(Default)]
pub struct MockChainRpc {
    inner: Mutex<MockChainInner>,
}

#[derive(Default)]
struct MockChainInner {
    head: u64,
    next_seq: u64,
    receipts: HashMap<String, TxReceipt>,
    broadcasts: Vec<Vec<u8>>,
    fail_next_broadcast: bool,
    reject_broadcasts: u32,
    events: Vec<(u64, SettlementEvent)>,
}

impl MockChainRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.inner.lock().unwrap().head = head;
    }

    pub fn set_next_sequencing(&self, seq: u64) {
        self.inner.lock().unwrap().next_seq = seq;
    }

    pub fn set_receipt(&self, tx_hash: &str, success: bool) {
        self.inner
            .lock()
            .unwrap()
            .receipts
            .insert(tx_hash.to_string(), TxReceipt { success });
    }

    pub fn fail_next_broadcast(&self) {
        self.inner.lock().unwrap().fail_next_broadcast = true;
    }

    /// Next broadcast is rejected by the node (e.g. sequencing already
    /// consumed), as opposed to a transport failure. Calls stack, so two
    /// calls reject the next two broadcasts.
    pub fn reject_next_broadcast(&self) {
        self.inner.lock().unwrap().reject_broadcasts += 1;
    }

    pub fn push_event(&self, height: u64, event: SettlementEvent) {
        self.inner.lock().unwrap().events.push((height, event));
    }

    pub fn broadcast_count(&self) -> usize {
        self.inner.lock().unwrap().broadcasts.len()
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    fn chain_id(&self) -> &str {
        "MOCK"
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, RpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_broadcast {
            inner.fail_next_broadcast = false;
            return Err(RpcError::Transport("scripted broadcast failure".to_string()));
        }
        if inner.reject_broadcasts > 0 {
            inner.reject_broadcasts -= 1;
            return Err(RpcError::Rejected("scripted broadcast rejection".to_string()));
        }
        inner.broadcasts.push(raw_tx.to_vec());
        Ok(format!("0x{}", hex::encode(&raw_tx[..raw_tx.len().min(8)])))
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        Ok(self.inner.lock().unwrap().receipts.get(tx_hash).copied())
    }

    async fn next_sequencing_value(&self, _signer: &str) -> Result<u64, RpcError> {
        Ok(self.inner.lock().unwrap().next_seq)
    }

    async fn head(&self) -> Result<u64, RpcError> {
        Ok(self.inner.lock().unwrap().head)
    }

    async fn settlement_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<SettlementEvent>, RpcError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(h, _)| *h >= from && *h <= to)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

/// Mock codec: length-prefixed action ids, enough to make batches distinct.
pub struct MockCodec {
    counter: bool,
}

impl MockCodec {
    pub fn new(counter: bool) -> Self {
        Self { counter }
    }
}

impl TxCodec for MockCodec {
    fn counter_sequencing(&self) -> bool {
        self.counter
    }

    fn encode_batch(
        &self,
        actions: &[PendingAction],
        sequencing: u64,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        out.extend_from_slice(&sequencing.to_be_bytes());
        for action in actions {
            out.extend_from_slice(&action.id.to_be_bytes());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_chain_scripting() {
        let chain = MockChainRpc::new();
        chain.set_head(100);
        chain.set_receipt("0xabc", true);

        assert_eq!(chain.head().await.unwrap(), 100);
        assert_eq!(
            chain.receipt("0xabc").await.unwrap(),
            Some(TxReceipt { success: true })
        );
        assert_eq!(chain.receipt("0xmissing").await.unwrap(), None);

        chain.fail_next_broadcast();
        assert!(chain.broadcast(&[1, 2]).await.is_err());
        assert_eq!(chain.broadcast_count(), 0);
        assert!(chain.broadcast(&[1, 2]).await.is_ok());
        assert_eq!(chain.broadcast_count(), 1);
    }
}
