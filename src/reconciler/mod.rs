//! Balance reconciler: cross-checks crawled settlement events against the
//! ledger.
//!
//! For every event the contract reported, the margin delta it claims must
//! match the amount the ledger recorded for the same operation, within a
//! fixed absolute tolerance that covers fixed-point rounding. A miss in
//! either direction is a real-money discrepancy: the worker stops and the
//! event stays PENDING as evidence.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::action::store::{SettlementStore, StoreError};
use crate::action::types::{ActionKind, ChainEventRecord};
use crate::config::PipelineConfig;
use crate::ledger::{LedgerError, LedgerReader};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("No ledger record behind event {event_id} ({kind} action {action_id})")]
    MissingLedgerRecord {
        event_id: i64,
        kind: ActionKind,
        action_id: i64,
    },

    #[error(
        "Balance divergence on event {event_id}: ledger says {expected}, chain says {observed}"
    )]
    Divergence {
        event_id: i64,
        expected: Decimal,
        observed: Decimal,
    },
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReconcileError::MissingLedgerRecord { .. } | ReconcileError::Divergence { .. }
        )
    }
}

pub struct Reconciler {
    store: Arc<dyn SettlementStore>,
    ledger: Arc<dyn LedgerReader>,
    epsilon: Decimal,
    batch: i64,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        ledger: Arc<dyn LedgerReader>,
        pipeline: &PipelineConfig,
    ) -> Self {
        let epsilon = Decimal::from_str(&pipeline.epsilon)
            .unwrap_or_else(|_| panic!("Bad epsilon in config: {:?}", pipeline.epsilon));
        Self {
            store,
            ledger,
            epsilon,
            batch: pipeline.reconcile_batch,
            interval: Duration::from_millis(pipeline.reconcile_interval_ms),
        }
    }

    pub async fn run(&self) -> Result<(), ReconcileError> {
        info!(epsilon = %self.epsilon, "Reconciler started");
        loop {
            match self.step().await {
                Ok(0) => tokio::time::sleep(self.interval).await,
                Ok(n) => debug!(events = n, "Reconciled"),
                Err(e) if e.is_fatal() => {
                    error!("Reconciler halted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Reconcile iteration failed, will retry: {}", e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }

    /// Check one batch of pending events, oldest first. Stops at the first
    /// discrepancy, leaving that event PENDING.
    pub async fn step(&self) -> Result<usize, ReconcileError> {
        let events = self.store.pending_events(self.batch).await?;
        let checked = events.len();
        for event in events {
            self.check(&event).await?;
            self.store.mark_event_success(event.id).await?;
        }
        Ok(checked)
    }

    async fn check(&self, event: &ChainEventRecord) -> Result<(), ReconcileError> {
        let expected = match event.kind {
            ActionKind::Trade => self.ledger.trade_leg_margin(event.action_id).await?,
            ActionKind::Withdraw => self.ledger.withdrawal_amount(event.action_id).await?,
            ActionKind::Funding => self.ledger.funding_amount(event.action_id).await?,
        }
        .ok_or(ReconcileError::MissingLedgerRecord {
            event_id: event.id,
            kind: event.kind,
            action_id: event.action_id,
        })?;

        // Withdrawals drain margin; everything else reports the credit side
        let observed = match event.kind {
            ActionKind::Withdraw => event.margin_before - event.margin_after,
            _ => event.margin_after - event.margin_before,
        };

        let drift = (expected - observed).abs();
        if drift > self.epsilon {
            return Err(ReconcileError::Divergence {
                event_id: event.id,
                expected,
                observed,
            });
        }
        debug!(
            event_id = event.id,
            action_id = event.action_id,
            %drift,
            "Event reconciled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::store::MemStore;
    use crate::action::types::{NewChainEvent, ValidationStatus};
    use crate::ledger::MemLedger;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn event(
        log_index: i32,
        kind: ActionKind,
        action_id: i64,
        before: &str,
        after: &str,
    ) -> NewChainEvent {
        NewChainEvent {
            chain_tx_id: "0xt1".to_string(),
            log_index,
            actor: "0xaaa".to_string(),
            account_id: 1,
            kind,
            action_id,
            op_id: "op-1".to_string(),
            margin_before: dec(before),
            margin_after: dec(after),
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        ledger: Arc<MemLedger>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let ledger = Arc::new(MemLedger::new());
        let reconciler = Reconciler::new(store.clone(), ledger.clone(), &PipelineConfig::default());
        Fixture {
            store,
            ledger,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_matching_margin_delta_passes() {
        let f = fixture();
        f.ledger.add_trade_margin(5, dec("100.000000"));
        f.store
            .insert_events(&[event(0, ActionKind::Trade, 5, "0", "100.000000")])
            .await
            .unwrap();

        assert_eq!(f.reconciler.step().await.unwrap(), 1);
        assert!(f.store.pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drift_within_epsilon_passes() {
        let f = fixture();
        f.ledger.add_trade_margin(5, dec("100.000000"));
        // Observed delta is off by 0.00001, under the 0.000015 tolerance
        f.store
            .insert_events(&[event(0, ActionKind::Trade, 5, "0", "100.000010")])
            .await
            .unwrap();

        assert_eq!(f.reconciler.step().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_divergence_is_fatal_and_keeps_event_pending() {
        let f = fixture();
        f.ledger.add_trade_margin(5, dec("100.000000"));
        f.store
            .insert_events(&[event(0, ActionKind::Trade, 5, "0", "105.000000")])
            .await
            .unwrap();

        let err = f.reconciler.step().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Divergence { .. }));
        assert!(err.is_fatal());

        let pending = f.store.pending_events(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].validation, ValidationStatus::Pending);
    }

    #[tokio::test]
    async fn test_withdrawal_compares_against_drained_margin() {
        let f = fixture();
        f.ledger.add_withdrawal(9, dec("25.5"));
        f.store
            .insert_events(&[event(0, ActionKind::Withdraw, 9, "100.000000", "74.500000")])
            .await
            .unwrap();

        assert_eq!(f.reconciler.step().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_ledger_record_is_fatal() {
        let f = fixture();
        f.store
            .insert_events(&[event(0, ActionKind::Funding, 77, "0", "1.000000")])
            .await
            .unwrap();

        let err = f.reconciler.step().await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::MissingLedgerRecord { action_id: 77, .. }
        ));
        assert!(err.is_fatal());
    }
}
