//! Resend guard: re-broadcasts unresolved transactions whose bytes may
//! never have reached the chain.
//!
//! Runs at tracker startup, periodically, and after any broadcast error.
//! Re-broadcasting already-landed bytes is a chain-level no-op, so the
//! sweep never needs to know whether the first attempt got through. The
//! receipt pre-check just skips the obviously-landed ones.
//!
//! On counter-sequencing chains a PENDING transaction can become
//! permanently unlandable: some other transaction consumed its sequencing
//! value. The node rejects it on re-broadcast, and the guard re-signs the
//! same action batch under a fresh value, at most once per transaction; a
//! second rejection halts the tracker instead. SENT transactions are never
//! re-signed; their bytes were accepted once and either land or are
//! eventually rejected back to the operator.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::TrackError;
use crate::action::store::SettlementStore;
use crate::action::types::{ChainTransaction, TxStatus};
use crate::chain::signer::{TxSigner, UnsignedTx};
use crate::chain::{ChainRpc, RpcError, SequencingCounter, TxCodec};

pub struct ResendGuard {
    store: Arc<dyn SettlementStore>,
    rpc: Arc<dyn ChainRpc>,
    codec: Arc<dyn TxCodec>,
    signer: Arc<dyn TxSigner>,
    /// Shared with the submitter; a re-sign here consumes a sequencing
    /// value the submitter's cached copy knows nothing about.
    counter: Arc<SequencingCounter>,
}

impl ResendGuard {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rpc: Arc<dyn ChainRpc>,
        codec: Arc<dyn TxCodec>,
        signer: Arc<dyn TxSigner>,
        counter: Arc<SequencingCounter>,
    ) -> Self {
        Self {
            store,
            rpc,
            codec,
            signer,
            counter,
        }
    }

    /// One best-effort pass over all unresolved transactions. Returns how
    /// many were re-broadcast. Individual broadcast failures are logged
    /// and left for the next sweep; store failures abort the pass.
    pub async fn sweep(&self) -> Result<usize, TrackError> {
        // Snapshot first so a transaction re-signed to SENT in this pass is
        // not visited a second time by its own sweep
        let mut unresolved = Vec::new();
        for status in [TxStatus::Pending, TxStatus::Sent] {
            for tx in self.store.transactions_with_status(status).await? {
                unresolved.push((status, tx));
            }
        }

        let mut resent = 0;
        for (status, tx) in unresolved {
            if self.rpc.receipt(&tx.tx_hash).await?.is_some() {
                continue;
            }
            match self.rpc.broadcast(&tx.raw_tx).await {
                Ok(_) => {
                    if status == TxStatus::Pending {
                        self.store
                            .update_tx_status(tx.id, TxStatus::Pending, TxStatus::Sent)
                            .await?;
                    }
                    let age_secs = (Utc::now() - tx.created_at).num_seconds();
                    debug!(tx_id = tx.id, tx_hash = %tx.tx_hash, age_secs, "Re-broadcast");
                    resent += 1;
                }
                Err(RpcError::Rejected(reason))
                    if status == TxStatus::Pending && self.codec.counter_sequencing() =>
                {
                    if tx.resigned {
                        return Err(TrackError::ResignExhausted { tx_id: tx.id });
                    }
                    info!(
                        tx_id = tx.id,
                        "Broadcast rejected ({}), re-signing with fresh sequencing", reason
                    );
                    self.resign(&tx).await?;
                    resent += 1;
                }
                Err(e) => {
                    warn!(tx_id = tx.id, "Re-broadcast failed, leaving for next sweep: {}", e);
                }
            }
        }
        Ok(resent)
    }

    /// Re-encode and re-sign a not-yet-landed batch under the chain's
    /// current sequencing value, then broadcast the replacement.
    async fn resign(&self, tx: &ChainTransaction) -> Result<(), TrackError> {
        let actions = self.store.actions_for_tx(tx.id).await?;
        let sequencing = self
            .rpc
            .next_sequencing_value(self.signer.address())
            .await?;
        let payload = self.codec.encode_batch(&actions, sequencing)?;
        let signed = self
            .signer
            .sign(&UnsignedTx {
                payload,
                sequencing,
            })
            .await?;

        // Durable before broadcast, same order as initial submission
        self.store
            .resign_transaction(tx.id, &signed.tx_hash, sequencing as i64, &signed.raw_tx)
            .await?;
        // The submitter's cached counter is stale now: this consumed the
        // value it would have handed out next
        self.counter.reset().await;
        self.rpc.broadcast(&signed.raw_tx).await?;
        self.store
            .update_tx_status(tx.id, TxStatus::Pending, TxStatus::Sent)
            .await?;
        info!(
            tx_id = tx.id,
            old_hash = %tx.tx_hash,
            new_hash = %signed.tx_hash,
            sequencing,
            "Transaction re-signed"
        );
        Ok(())
    }
}
