//! Transaction lifecycle tracker.
//!
//! Drives every transaction through PENDING -> SENT -> {SUCCESS, REVERT}.
//! Transitions are one-directional CAS updates, so a raced update (another
//! tracker instance, an operator fix) is detected instead of clobbered.
//!
//! A confirmed on-chain revert means the contract refused a settlement the
//! ledger already considers done. That is never recoverable by software:
//! the transaction is marked REVERT and the tracker stops, which also
//! freezes the submitter through the shared store.

pub mod resend;

pub use resend::ResendGuard;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::action::store::{SettlementStore, StoreError};
use crate::action::types::TxStatus;
use crate::chain::signer::{SignError, TxSigner};
use crate::chain::{ChainRpc, CodecError, RpcError, SequencingCounter, TxCodec};
use crate::config::PipelineConfig;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Signing error: {0}")]
    Sign(#[from] SignError),

    #[error("Transaction {tx_id} reverted on-chain; settlement halted")]
    Reverted { tx_id: i64 },

    #[error("Transaction {tx_id} rejected again after its one re-sign; operator intervention required")]
    ResignExhausted { tx_id: i64 },
}

impl TrackError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrackError::Reverted { .. } | TrackError::ResignExhausted { .. }
        )
    }
}

pub struct LifecycleTracker {
    store: Arc<dyn SettlementStore>,
    rpc: Arc<dyn ChainRpc>,
    guard: ResendGuard,
    interval: Duration,
    resend_every: u64,
}

impl LifecycleTracker {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rpc: Arc<dyn ChainRpc>,
        codec: Arc<dyn TxCodec>,
        signer: Arc<dyn TxSigner>,
        counter: Arc<SequencingCounter>,
        pipeline: &PipelineConfig,
    ) -> Self {
        let guard = ResendGuard::new(store.clone(), rpc.clone(), codec, signer, counter);
        Self {
            store,
            rpc,
            guard,
            interval: Duration::from_millis(pipeline.track_interval_ms),
            resend_every: pipeline.resend_every.max(1),
        }
    }

    pub async fn run(&self) -> Result<(), TrackError> {
        info!(chain = self.rpc.chain_id(), "Lifecycle tracker started");

        // Startup sweep: a crash between persist and broadcast leaves
        // PENDING rows whose bytes may or may not have reached the chain
        if let Err(e) = self.guard.sweep().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Startup resend sweep failed: {}", e);
        }

        let mut iteration: u64 = 0;
        loop {
            iteration = iteration.wrapping_add(1);
            if iteration % self.resend_every == 0 {
                if let Err(e) = self.guard.sweep().await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!("Periodic resend sweep failed: {}", e);
                }
            }

            match self.step().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(chain = self.rpc.chain_id(), "Tracker halted: {}", e);
                    return Err(e);
                }
                Err(e) => error!("Track iteration failed, will retry: {}", e),
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One pass over the unresolved transactions.
    pub async fn step(&self) -> Result<(), TrackError> {
        if let Some(tx_id) = self.store.first_reverted().await? {
            return Err(TrackError::Reverted { tx_id });
        }
        self.broadcast_pending().await?;
        self.confirm_sent().await?;
        Ok(())
    }

    async fn broadcast_pending(&self) -> Result<(), TrackError> {
        for tx in self
            .store
            .transactions_with_status(TxStatus::Pending)
            .await?
        {
            match self.rpc.broadcast(&tx.raw_tx).await {
                Ok(_) => {
                    if !self
                        .store
                        .update_tx_status(tx.id, TxStatus::Pending, TxStatus::Sent)
                        .await?
                    {
                        warn!(tx_id = tx.id, "Lost PENDING->SENT race, skipping");
                    } else {
                        debug!(tx_id = tx.id, tx_hash = %tx.tx_hash, "Broadcast");
                    }
                }
                Err(e) => {
                    // The sweep sorts out which transactions actually made
                    // it before the error is surfaced to the run loop
                    warn!(tx_id = tx.id, "Broadcast failed, running sweep: {}", e);
                    self.guard.sweep().await?;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn confirm_sent(&self) -> Result<(), TrackError> {
        for tx in self.store.transactions_with_status(TxStatus::Sent).await? {
            let Some(receipt) = self.rpc.receipt(&tx.tx_hash).await? else {
                continue;
            };
            if receipt.success {
                self.store
                    .update_tx_status(tx.id, TxStatus::Sent, TxStatus::Success)
                    .await?;
                info!(tx_id = tx.id, tx_hash = %tx.tx_hash, "Transaction confirmed");
            } else {
                self.store
                    .update_tx_status(tx.id, TxStatus::Sent, TxStatus::Revert)
                    .await?;
                return Err(TrackError::Reverted { tx_id: tx.id });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::store::MemStore;
    use crate::action::types::{ActionKind, NewAction, NewTransaction, SettlementParams};
    use crate::chain::signer::MockSigner;
    use crate::chain::{MockChainRpc, MockCodec};
    use uuid::Uuid;

    async fn seed_tx(store: &MemStore, raw: &[u8], hash: &str) -> i64 {
        store
            .insert_actions(&[NewAction {
                kind: ActionKind::Withdraw,
                source_id: raw[0] as i64,
                source_offset: 1,
                raw_payload: serde_json::Value::Null,
                params: SettlementParams::Withdraw {
                    account_id: 1,
                    address: "0xaaa".to_string(),
                    amount_fp: 1,
                    op_id: Uuid::new_v4(),
                },
            }])
            .await
            .unwrap();
        let ids: Vec<i64> = store
            .unassigned_actions(10)
            .await
            .unwrap()
            .iter()
            .map(|a| a.id)
            .collect();
        store
            .persist_transaction(
                &NewTransaction {
                    tx_hash: hash.to_string(),
                    signer: "0xmatcher".to_string(),
                    sequencing: 1,
                    raw_tx: raw.to_vec(),
                },
                &ids,
            )
            .await
            .unwrap()
    }

    fn tracker(store: Arc<MemStore>, rpc: Arc<MockChainRpc>) -> LifecycleTracker {
        LifecycleTracker::new(
            store,
            rpc,
            Arc::new(MockCodec::new(true)),
            Arc::new(MockSigner::new("0xmatcher")),
            Arc::new(SequencingCounter::new()),
            &PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_pending_is_broadcast_then_sent() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        let tx_id = seed_tx(&store, &[1, 2, 3], "0xh1").await;

        let t = tracker(store.clone(), rpc.clone());
        t.step().await.unwrap();

        assert_eq!(rpc.broadcast_count(), 1);
        assert_eq!(store.transaction(tx_id).unwrap().status, TxStatus::Sent);
    }

    #[tokio::test]
    async fn test_sent_confirms_on_success_receipt() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        let tx_id = seed_tx(&store, &[1], "0xh1").await;

        let t = tracker(store.clone(), rpc.clone());
        t.step().await.unwrap();
        // No receipt yet: stays SENT
        t.step().await.unwrap();
        assert_eq!(store.transaction(tx_id).unwrap().status, TxStatus::Sent);

        rpc.set_receipt("0xh1", true);
        t.step().await.unwrap();
        assert_eq!(store.transaction(tx_id).unwrap().status, TxStatus::Success);
    }

    #[tokio::test]
    async fn test_revert_receipt_is_fatal_and_blocking() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        let tx_id = seed_tx(&store, &[1], "0xh1").await;

        let t = tracker(store.clone(), rpc.clone());
        t.step().await.unwrap();
        rpc.set_receipt("0xh1", false);

        let err = t.step().await.unwrap_err();
        assert!(matches!(err, TrackError::Reverted { tx_id: id } if id == tx_id));
        assert_eq!(store.transaction(tx_id).unwrap().status, TxStatus::Revert);

        // Every later pass refuses to proceed while the REVERT row exists
        assert!(t.step().await.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_broadcast_failure_sweeps_then_surfaces() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        let tx_id = seed_tx(&store, &[1], "0xh1").await;

        rpc.fail_next_broadcast();
        let t = tracker(store.clone(), rpc.clone());
        let err = t.step().await.unwrap_err();
        assert!(matches!(err, TrackError::Rpc(_)));
        assert!(!err.is_fatal());

        // The sweep inside the failure path already re-broadcast it
        assert_eq!(rpc.broadcast_count(), 1);
        assert_eq!(store.transaction(tx_id).unwrap().status, TxStatus::Sent);
    }
}
