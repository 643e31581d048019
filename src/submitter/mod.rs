//! Batch submitter: drains unassigned actions into signed transactions.
//!
//! One transaction per iteration, FIFO over the action queue, capped by the
//! in-flight budget (unresolved PENDING|SENT transactions). The transaction
//! row and the action assignments are persisted atomically before anything
//! touches the chain; broadcasting is the tracker's job.
//!
//! An existing REVERT transaction halts submission entirely until an
//! operator intervenes.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::action::store::{SettlementStore, StoreError};
use crate::action::types::NewTransaction;
use crate::chain::signer::{SignError, TxSigner, UnsignedTx};
use crate::chain::{ChainRpc, CodecError, RpcError, SequencingCounter, TxCodec};
use crate::config::PipelineConfig;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Signing error: {0}")]
    Sign(#[from] SignError),

    #[error("Transaction {tx_id} is REVERT; submission halted")]
    Reverted { tx_id: i64 },
}

impl SubmitError {
    /// Fatal errors stop the worker; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SubmitError::Reverted { .. } | SubmitError::Codec(_))
    }
}

pub struct BatchSubmitter {
    store: Arc<dyn SettlementStore>,
    rpc: Arc<dyn ChainRpc>,
    codec: Arc<dyn TxCodec>,
    signer: Arc<dyn TxSigner>,
    max_in_flight: i64,
    batch_size: i64,
    interval: Duration,
    /// Counter state for counter-sequencing chains, shared with the resend
    /// guard so a re-sign there invalidates the local copy here.
    counter: Arc<SequencingCounter>,
}

impl BatchSubmitter {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rpc: Arc<dyn ChainRpc>,
        codec: Arc<dyn TxCodec>,
        signer: Arc<dyn TxSigner>,
        counter: Arc<SequencingCounter>,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            rpc,
            codec,
            signer,
            max_in_flight: pipeline.max_in_flight,
            batch_size: pipeline.batch_size,
            interval: Duration::from_millis(pipeline.submit_interval_ms),
            counter,
        }
    }

    pub async fn run(&self) -> Result<(), SubmitError> {
        info!(chain = self.rpc.chain_id(), "Batch submitter started");
        loop {
            match self.step().await {
                Ok(Some(tx_id)) => debug!(tx_id, "Submitted transaction"),
                Ok(None) => tokio::time::sleep(self.interval).await,
                Err(e) if e.is_fatal() => {
                    error!(chain = self.rpc.chain_id(), "Submitter halted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Submit iteration failed, will retry: {}", e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    /// One submission attempt. `Ok(None)` means there was nothing to do:
    /// either no unassigned actions or the in-flight budget is full.
    pub async fn step(&self) -> Result<Option<i64>, SubmitError> {
        if let Some(tx_id) = self.store.first_reverted().await? {
            return Err(SubmitError::Reverted { tx_id });
        }

        let in_flight = self.store.unresolved_count().await?;
        if in_flight >= self.max_in_flight {
            debug!(in_flight, "In-flight budget full, holding submission");
            return Ok(None);
        }

        let actions = self.store.unassigned_actions(self.batch_size).await?;
        if actions.is_empty() {
            return Ok(None);
        }

        let sequencing = self.sequencing_value().await?;
        let payload = self.codec.encode_batch(&actions, sequencing)?;
        let signed = self
            .signer
            .sign(&UnsignedTx {
                payload,
                sequencing,
            })
            .await?;

        let action_ids: Vec<i64> = actions.iter().map(|a| a.id).collect();
        let tx = NewTransaction {
            tx_hash: signed.tx_hash,
            signer: self.signer.address().to_string(),
            sequencing: sequencing as i64,
            raw_tx: signed.raw_tx,
        };
        let tx_id = self.store.persist_transaction(&tx, &action_ids).await?;

        // Counter advances only once the row it was spent on is durable
        if self.codec.counter_sequencing() {
            self.counter.set(sequencing + 1).await;
        }

        info!(
            tx_id,
            tx_hash = %tx.tx_hash,
            sequencing,
            actions = action_ids.len(),
            "Persisted transaction batch"
        );
        Ok(Some(tx_id))
    }

    async fn sequencing_value(&self) -> Result<u64, SubmitError> {
        if !self.codec.counter_sequencing() {
            return Ok(self.rpc.next_sequencing_value(self.signer.address()).await?);
        }
        match self.counter.cached().await {
            Some(next) => Ok(next),
            None => {
                let next = self.rpc.next_sequencing_value(self.signer.address()).await?;
                self.counter.set(next).await;
                Ok(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::store::MemStore;
    use crate::action::types::{ActionKind, NewAction, SettlementParams, TxStatus};
    use crate::chain::{MockChainRpc, MockCodec, MockSigner};
    use uuid::Uuid;

    fn withdraw(source_id: i64) -> NewAction {
        NewAction {
            kind: ActionKind::Withdraw,
            source_id,
            source_offset: source_id,
            raw_payload: serde_json::Value::Null,
            params: SettlementParams::Withdraw {
                account_id: 1,
                address: "0xaaa".to_string(),
                amount_fp: 1_000_000,
                op_id: Uuid::new_v4(),
            },
        }
    }

    fn submitter(
        store: Arc<MemStore>,
        rpc: Arc<MockChainRpc>,
        counter_chain: bool,
        max_in_flight: i64,
    ) -> BatchSubmitter {
        let pipeline = PipelineConfig {
            max_in_flight,
            batch_size: 4,
            ..PipelineConfig::default()
        };
        BatchSubmitter::new(
            store,
            rpc,
            Arc::new(MockCodec::new(counter_chain)),
            Arc::new(MockSigner::new("0xmatcher")),
            Arc::new(SequencingCounter::new()),
            &pipeline,
        )
    }

    #[tokio::test]
    async fn test_submit_assigns_batch_atomically() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        rpc.set_next_sequencing(5);
        store
            .insert_actions(&[withdraw(1), withdraw(2)])
            .await
            .unwrap();

        let s = submitter(store.clone(), rpc, true, 8);
        let tx_id = s.step().await.unwrap().unwrap();

        let tx = store.transaction(tx_id).unwrap();
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.sequencing, 5);
        assert!(store.unassigned_actions(10).await.unwrap().is_empty());
        assert_eq!(store.actions_for_tx(tx_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_counter_advances_locally_without_refetch() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        rpc.set_next_sequencing(5);
        store.insert_actions(&[withdraw(1)]).await.unwrap();

        let s = submitter(store.clone(), rpc.clone(), true, 8);
        let first = s.step().await.unwrap().unwrap();

        // Chain-side counter is stale now; local copy must win
        rpc.set_next_sequencing(999);
        store.insert_actions(&[withdraw(2)]).await.unwrap();
        let second = s.step().await.unwrap().unwrap();

        assert_eq!(store.transaction(first).unwrap().sequencing, 5);
        assert_eq!(store.transaction(second).unwrap().sequencing, 6);
    }

    #[tokio::test]
    async fn test_fresh_sequencing_chains_refetch_every_time() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        rpc.set_next_sequencing(100);
        store.insert_actions(&[withdraw(1)]).await.unwrap();

        let s = submitter(store.clone(), rpc.clone(), false, 8);
        let first = s.step().await.unwrap().unwrap();

        rpc.set_next_sequencing(140);
        store.insert_actions(&[withdraw(2)]).await.unwrap();
        let second = s.step().await.unwrap().unwrap();

        assert_eq!(store.transaction(first).unwrap().sequencing, 100);
        assert_eq!(store.transaction(second).unwrap().sequencing, 140);
    }

    #[tokio::test]
    async fn test_counter_reset_forces_refetch() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        rpc.set_next_sequencing(5);
        store.insert_actions(&[withdraw(1)]).await.unwrap();

        let counter = Arc::new(SequencingCounter::new());
        let s = BatchSubmitter::new(
            store.clone(),
            rpc.clone(),
            Arc::new(MockCodec::new(true)),
            Arc::new(MockSigner::new("0xmatcher")),
            counter.clone(),
            &PipelineConfig::default(),
        );
        s.step().await.unwrap().unwrap();

        // Something else consumed nonces on the chain; after a reset the
        // next submission picks up the chain's value instead of local 6
        counter.reset().await;
        rpc.set_next_sequencing(9);
        store.insert_actions(&[withdraw(2)]).await.unwrap();
        let second = s.step().await.unwrap().unwrap();
        assert_eq!(store.transaction(second).unwrap().sequencing, 9);
    }

    #[tokio::test]
    async fn test_in_flight_budget_blocks_submission() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        store.insert_actions(&[withdraw(1), withdraw(2)]).await.unwrap();

        let s = submitter(store.clone(), rpc, true, 1);
        assert!(s.step().await.unwrap().is_some());

        // One unresolved transaction fills the budget of 1
        store.insert_actions(&[withdraw(3)]).await.unwrap();
        assert!(s.step().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_existing_revert_halts_submission() {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        store.insert_actions(&[withdraw(1)]).await.unwrap();

        let s = submitter(store.clone(), rpc, true, 8);
        let tx_id = s.step().await.unwrap().unwrap();
        store
            .update_tx_status(tx_id, TxStatus::Pending, TxStatus::Sent)
            .await
            .unwrap();
        store
            .update_tx_status(tx_id, TxStatus::Sent, TxStatus::Revert)
            .await
            .unwrap();

        store.insert_actions(&[withdraw(2)]).await.unwrap();
        let err = s.step().await.unwrap_err();
        assert!(matches!(err, SubmitError::Reverted { .. }));
        assert!(err.is_fatal());
    }
}
