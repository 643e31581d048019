//! Chain history crawler: pulls confirmed settlement events into the store.
//!
//! Crawls bounded windows behind the chain head, held back by the
//! confirmation depth so reorged blocks are never read. The checkpoint
//! advances only after the window's events are durably inserted, so a
//! crash re-crawls the last window; the (chain_tx_id, log_index) key makes
//! that harmless.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::action::store::{SettlementStore, StoreError};
use crate::action::types::NewChainEvent;
use crate::cache::AddressCache;
use crate::chain::{ChainRpc, RpcError, SettlementEvent};
use crate::config::PipelineConfig;
use crate::ledger::LedgerError;
use crate::scale::from_fixed;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Settlement event from unknown actor {actor:?} in tx {chain_tx_id}")]
    UnknownActor { actor: String, chain_tx_id: String },
}

impl CrawlError {
    /// Undecodable contract data and unknown actors mean the contract and
    /// the ledger disagree about who exists; crawling past that would
    /// silently drop settlement history.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::Rpc(RpcError::Decode(_)) | CrawlError::UnknownActor { .. }
        )
    }
}

pub struct ChainCrawler {
    store: Arc<dyn SettlementStore>,
    rpc: Arc<dyn ChainRpc>,
    cache: Arc<AddressCache>,
    checkpoint: String,
    confirmation_depth: u64,
    max_window: u64,
    margin_scale: u32,
    interval: Duration,
    last_head: AtomicU64,
    stale_iterations: AtomicU64,
}

/// Iterations without head movement before the node is called stale.
const STALE_HEAD_ITERATIONS: u64 = 60;

impl ChainCrawler {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rpc: Arc<dyn ChainRpc>,
        cache: Arc<AddressCache>,
        checkpoint: &str,
        confirmation_depth: u64,
        max_window: u64,
        pipeline: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            rpc,
            cache,
            checkpoint: checkpoint.to_string(),
            confirmation_depth,
            max_window,
            margin_scale: pipeline.margin_scale,
            interval: Duration::from_millis(pipeline.crawl_interval_ms),
            last_head: AtomicU64::new(0),
            stale_iterations: AtomicU64::new(0),
        }
    }

    pub async fn run(&self) -> Result<(), CrawlError> {
        info!(
            chain = self.rpc.chain_id(),
            checkpoint = %self.checkpoint,
            "Chain crawler started"
        );
        loop {
            match self.step().await {
                Ok(0) => tokio::time::sleep(self.interval).await,
                Ok(n) => debug!(events = n, "Crawled window"),
                Err(e) if e.is_fatal() => {
                    error!(chain = self.rpc.chain_id(), "Crawler halted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Crawl iteration failed, will retry: {}", e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    /// Crawl the next window. Returns the number of events seen in it
    /// (including re-crawled duplicates), zero when no window is ready.
    pub async fn step(&self) -> Result<usize, CrawlError> {
        let head = self.rpc.head().await?;
        self.note_head(head);
        let safe = head.saturating_sub(self.confirmation_depth);
        let position = self
            .store
            .checkpoint(&self.checkpoint)
            .await?
            .unwrap_or(0)
            .max(0) as u64;

        if safe <= position {
            if position > 0 && head < position {
                warn!(head, position, "Chain head behind checkpoint");
            }
            return Ok(0);
        }
        let from = position + 1;
        let to = safe.min(position + self.max_window);

        let events = self.rpc.settlement_events(from, to).await?;
        let mut rows = Vec::with_capacity(events.len());
        for event in &events {
            rows.push(self.to_row(event).await?);
        }

        let inserted = self.store.insert_events(&rows).await?;
        if inserted < rows.len() as u64 {
            debug!(
                "Skipped {} already-crawled events",
                rows.len() as u64 - inserted
            );
        }
        self.store
            .advance_checkpoint(&self.checkpoint, to as i64)
            .await?;
        debug!(from, to, events = events.len(), "Window complete");
        Ok(events.len())
    }

    /// Non-fatal node health signal: a head that stops moving means the
    /// node is stalled or partitioned, not that settlement went wrong.
    fn note_head(&self, head: u64) {
        if self.last_head.swap(head, Ordering::Relaxed) == head {
            let stale = self.stale_iterations.fetch_add(1, Ordering::Relaxed) + 1;
            if stale == STALE_HEAD_ITERATIONS {
                warn!(
                    chain = self.rpc.chain_id(),
                    head, "Chain head has not advanced for {} iterations", stale
                );
            }
        } else {
            self.stale_iterations.store(0, Ordering::Relaxed);
        }
    }

    async fn to_row(&self, event: &SettlementEvent) -> Result<NewChainEvent, CrawlError> {
        let account_id = self.cache.account_of(&event.actor).await?.ok_or_else(|| {
            CrawlError::UnknownActor {
                actor: event.actor.clone(),
                chain_tx_id: event.chain_tx_id.clone(),
            }
        })?;
        // A margin outside Decimal's range is undecodable contract data,
        // fatal like any other decode anomaly
        let margin_before = from_fixed(event.margin_before_fp, self.margin_scale)
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        let margin_after = from_fixed(event.margin_after_fp, self.margin_scale)
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        Ok(NewChainEvent {
            chain_tx_id: event.chain_tx_id.clone(),
            log_index: event.log_index,
            actor: event.actor.clone(),
            account_id,
            kind: event.kind,
            action_id: event.action_id,
            op_id: event.op_id.clone(),
            margin_before,
            margin_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::store::MemStore;
    use crate::action::types::ActionKind;
    use crate::chain::MockChainRpc;
    use crate::ledger::MemLedger;

    fn event(tx: &str, log_index: i32, action_id: i64) -> SettlementEvent {
        SettlementEvent {
            chain_tx_id: tx.to_string(),
            log_index,
            actor: "0xaaa".to_string(),
            kind: ActionKind::Trade,
            action_id,
            op_id: "op-1".to_string(),
            margin_before_fp: 0,
            margin_after_fp: 100_000_000,
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        rpc: Arc<MockChainRpc>,
        ledger: Arc<MemLedger>,
        crawler: ChainCrawler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let rpc = Arc::new(MockChainRpc::new());
        let ledger = Arc::new(MemLedger::new());
        let cache = Arc::new(AddressCache::new(ledger.clone()));
        let crawler = ChainCrawler::new(
            store.clone(),
            rpc.clone(),
            cache,
            "test-crawl",
            12,
            50,
            &PipelineConfig::default(),
        );
        Fixture {
            store,
            rpc,
            ledger,
            crawler,
        }
    }

    #[tokio::test]
    async fn test_waits_for_confirmation_depth() {
        let f = fixture();
        f.ledger.add_account(1, "0xaaa");
        f.rpc.set_head(100);
        f.rpc.push_event(95, event("0xt1", 0, 1));

        // Safe height is 88: the event at 95 is not confirmed yet
        assert_eq!(f.crawler.step().await.unwrap(), 0);
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), Some(50));
        assert_eq!(f.store.event_count(), 0);

        f.rpc.set_head(110);
        assert_eq!(f.crawler.step().await.unwrap(), 1);
        assert_eq!(f.store.event_count(), 1);
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), Some(98));
    }

    #[tokio::test]
    async fn test_recrawl_inserts_no_duplicates() {
        let f = fixture();
        f.ledger.add_account(1, "0xaaa");
        f.rpc.set_head(100);
        f.rpc.push_event(40, event("0xt1", 0, 1));
        f.rpc.push_event(40, event("0xt1", 1, 2));

        assert_eq!(f.crawler.step().await.unwrap(), 2);
        assert_eq!(f.store.event_count(), 2);

        // Same events land in a later window (simulated crash re-crawl)
        f.rpc.push_event(60, event("0xt1", 0, 1));
        f.crawler.step().await.unwrap();
        assert_eq!(f.store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_actor_is_fatal() {
        let f = fixture();
        f.rpc.set_head(100);
        f.rpc.push_event(40, event("0xt1", 0, 1));

        let err = f.crawler.step().await.unwrap_err();
        assert!(matches!(err, CrawlError::UnknownActor { .. }));
        assert!(err.is_fatal());
        // Checkpoint untouched: window will be re-crawled
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let f = fixture();
        f.ledger.add_account(1, "0xaaa");
        f.rpc.set_head(1000);
        f.rpc.push_event(500, event("0xt1", 0, 1));

        // First window stops at max_window even though safe head is 988
        f.crawler.step().await.unwrap();
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), Some(50));

        f.crawler.step().await.unwrap();
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), Some(100));
    }

    #[tokio::test]
    async fn test_oversized_margin_is_fatal_decode_error() {
        let f = fixture();
        f.ledger.add_account(1, "0xaaa");
        f.rpc.set_head(100);
        let mut oversized = event("0xt1", 0, 1);
        oversized.margin_after_fp = 1i128 << 100;
        f.rpc.push_event(40, oversized);

        let err = f.crawler.step().await.unwrap_err();
        assert!(matches!(err, CrawlError::Rpc(RpcError::Decode(_))));
        assert!(err.is_fatal());
        assert_eq!(f.store.checkpoint("test-crawl").await.unwrap(), None);
        assert_eq!(f.store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_frozen_head_is_counted_as_stale() {
        let f = fixture();
        // Head below the confirmation depth: every pass is an empty window
        f.rpc.set_head(5);
        for _ in 0..=STALE_HEAD_ITERATIONS {
            f.crawler.step().await.unwrap();
        }
        // First pass saw the head move from 0; the rest did not
        assert_eq!(
            f.crawler.stale_iterations.load(Ordering::Relaxed),
            STALE_HEAD_ITERATIONS
        );

        f.rpc.set_head(6);
        f.crawler.step().await.unwrap();
        assert_eq!(f.crawler.stale_iterations.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_margin_scaling() {
        let f = fixture();
        f.ledger.add_account(1, "0xaaa");
        f.rpc.set_head(100);
        f.rpc.push_event(40, event("0xt1", 0, 1));
        f.crawler.step().await.unwrap();

        let pending = f.store.pending_events(10).await.unwrap();
        assert_eq!(pending[0].margin_after.to_string(), "100.000000");
        assert_eq!(pending[0].account_id, 1);
    }
}
