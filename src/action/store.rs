//! Durable settlement state: pending actions, chain transactions, crawled
//! events, and crawler checkpoints.
//!
//! All cross-worker coordination goes through these tables. The two load
//! bearing guarantees live here: idempotent inserts (uniqueness keys) and
//! atomic transaction+assignment persistence.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use super::types::{
    ActionKind, ChainEventRecord, ChainTransaction, NewAction, NewChainEvent, NewTransaction,
    PendingAction, TxStatus, ValidationStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Assignment would be partial: expected {expected} actions, matched {matched}")]
    PartialAssignment { expected: usize, matched: u64 },

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Idempotent batch insert keyed on (kind, source_id); duplicates are
    /// silently dropped. Returns how many rows were actually inserted.
    async fn insert_actions(&self, actions: &[NewAction]) -> Result<u64, StoreError>;

    /// Unassigned actions, oldest first.
    async fn unassigned_actions(&self, limit: i64) -> Result<Vec<PendingAction>, StoreError>;

    /// All actions owned by one transaction.
    async fn actions_for_tx(&self, tx_id: i64) -> Result<Vec<PendingAction>, StoreError>;

    /// Transactions currently counting against the in-flight budget
    /// (status PENDING or SENT).
    async fn unresolved_count(&self) -> Result<i64, StoreError>;

    /// Id of a REVERT-status transaction, if any exists.
    async fn first_reverted(&self) -> Result<Option<i64>, StoreError>;

    /// Insert the transaction row and assign all listed actions to it in one
    /// database transaction. Fails (and rolls back) unless every action was
    /// still unassigned.
    async fn persist_transaction(
        &self,
        tx: &NewTransaction,
        action_ids: &[i64],
    ) -> Result<i64, StoreError>;

    async fn transactions_with_status(
        &self,
        status: TxStatus,
    ) -> Result<Vec<ChainTransaction>, StoreError>;

    /// Compare-and-swap status transition. Returns false when the row was
    /// not in `from` anymore.
    async fn update_tx_status(
        &self,
        tx_id: i64,
        from: TxStatus,
        to: TxStatus,
    ) -> Result<bool, StoreError>;

    /// One-time hash/bytes reassignment of a not-yet-sent transaction that
    /// was re-signed with a fresh sequencing value. Sets the resigned flag
    /// so the guard never re-signs the same transaction twice.
    async fn resign_transaction(
        &self,
        tx_id: i64,
        tx_hash: &str,
        sequencing: i64,
        raw_tx: &[u8],
    ) -> Result<(), StoreError>;

    /// Idempotent batch insert keyed on (chain_tx_id, log_index).
    async fn insert_events(&self, events: &[NewChainEvent]) -> Result<u64, StoreError>;

    /// Events awaiting reconciliation, oldest first.
    async fn pending_events(&self, limit: i64) -> Result<Vec<ChainEventRecord>, StoreError>;

    async fn mark_event_success(&self, event_id: i64) -> Result<(), StoreError>;

    async fn checkpoint(&self, name: &str) -> Result<Option<i64>, StoreError>;

    /// Monotonic: never moves a checkpoint backwards.
    async fn advance_checkpoint(&self, name: &str, position: i64) -> Result<(), StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn action_from_row(row: &sqlx::postgres::PgRow) -> Result<PendingAction, StoreError> {
        let kind_id: i16 = row.get("kind");
        let kind = ActionKind::from_id(kind_id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown action kind {}", kind_id)))?;
        let params: serde_json::Value = row.get("params");
        let params = serde_json::from_value(params)
            .map_err(|e| StoreError::Corrupt(format!("undecodable params: {}", e)))?;
        Ok(PendingAction {
            id: row.get("id"),
            kind,
            source_id: row.get("source_id"),
            source_offset: row.get("source_offset"),
            raw_payload: row.get("raw_payload"),
            params,
            tx_ref: row.get("tx_ref"),
        })
    }

    fn tx_from_row(row: &sqlx::postgres::PgRow) -> Result<ChainTransaction, StoreError> {
        let status: String = row.get("status");
        let status = TxStatus::from_str(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown tx status {}", status)))?;
        Ok(ChainTransaction {
            id: row.get("id"),
            tx_hash: row.get("tx_hash"),
            signer: row.get("signer"),
            sequencing: row.get("sequencing"),
            raw_tx: row.get("raw_tx"),
            status,
            resigned: row.get("resigned"),
            created_at: row.get("created_at"),
        })
    }

    fn event_from_row(row: &sqlx::postgres::PgRow) -> Result<ChainEventRecord, StoreError> {
        let kind_id: i16 = row.get("kind");
        let kind = ActionKind::from_id(kind_id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown action kind {}", kind_id)))?;
        let validation: String = row.get("validation");
        let validation = ValidationStatus::from_str(&validation)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown validation {}", validation)))?;
        Ok(ChainEventRecord {
            id: row.get("id"),
            chain_tx_id: row.get("chain_tx_id"),
            log_index: row.get("log_index"),
            actor: row.get("actor"),
            account_id: row.get("account_id"),
            kind,
            action_id: row.get("action_id"),
            op_id: row.get("op_id"),
            margin_before: row.get("margin_before"),
            margin_after: row.get("margin_after"),
            validation,
        })
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert_actions(&self, actions: &[NewAction]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for action in actions {
            let params = serde_json::to_value(&action.params)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let result = sqlx::query(
                r#"INSERT INTO settlement_actions_tb
                   (kind, source_id, source_offset, raw_payload, params)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (kind, source_id) DO NOTHING"#,
            )
            .bind(action.kind.id())
            .bind(action.source_id)
            .bind(action.source_offset)
            .bind(&action.raw_payload)
            .bind(params)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn unassigned_actions(&self, limit: i64) -> Result<Vec<PendingAction>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, kind, source_id, source_offset, raw_payload, params, tx_ref
               FROM settlement_actions_tb
               WHERE tx_ref = 0
               ORDER BY id ASC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::action_from_row).collect()
    }

    async fn actions_for_tx(&self, tx_id: i64) -> Result<Vec<PendingAction>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, kind, source_id, source_offset, raw_payload, params, tx_ref
               FROM settlement_actions_tb
               WHERE tx_ref = $1
               ORDER BY id ASC"#,
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::action_from_row).collect()
    }

    async fn unresolved_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chain_tx_tb WHERE status IN ('PENDING', 'SENT')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn first_reverted(&self) -> Result<Option<i64>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM chain_tx_tb WHERE status = 'REVERT' ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn persist_transaction(
        &self,
        tx: &NewTransaction,
        action_ids: &[i64],
    ) -> Result<i64, StoreError> {
        let mut db_tx = self.pool.begin().await?;

        let tx_id: i64 = sqlx::query_scalar(
            r#"INSERT INTO chain_tx_tb (tx_hash, signer, sequencing, raw_tx, status)
               VALUES ($1, $2, $3, $4, 'PENDING')
               RETURNING id"#,
        )
        .bind(&tx.tx_hash)
        .bind(&tx.signer)
        .bind(tx.sequencing)
        .bind(&tx.raw_tx)
        .fetch_one(&mut *db_tx)
        .await?;

        let ids: Vec<i64> = action_ids.to_vec();
        let result = sqlx::query(
            "UPDATE settlement_actions_tb SET tx_ref = $1 WHERE id = ANY($2) AND tx_ref = 0",
        )
        .bind(tx_id)
        .bind(&ids)
        .execute(&mut *db_tx)
        .await?;

        // Anything less than a full match means some action was already
        // assigned elsewhere; roll everything back.
        if result.rows_affected() != action_ids.len() as u64 {
            db_tx.rollback().await?;
            return Err(StoreError::PartialAssignment {
                expected: action_ids.len(),
                matched: result.rows_affected(),
            });
        }

        db_tx.commit().await?;
        Ok(tx_id)
    }

    async fn transactions_with_status(
        &self,
        status: TxStatus,
    ) -> Result<Vec<ChainTransaction>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, tx_hash, signer, sequencing, raw_tx, status, resigned, created_at
               FROM chain_tx_tb
               WHERE status = $1
               ORDER BY id ASC"#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::tx_from_row).collect()
    }

    async fn update_tx_status(
        &self,
        tx_id: i64,
        from: TxStatus,
        to: TxStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE chain_tx_tb SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(tx_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn resign_transaction(
        &self,
        tx_id: i64,
        tx_hash: &str,
        sequencing: i64,
        raw_tx: &[u8],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE chain_tx_tb
               SET tx_hash = $1, sequencing = $2, raw_tx = $3, resigned = TRUE,
                   updated_at = NOW()
               WHERE id = $4 AND status = 'PENDING'"#,
        )
        .bind(tx_hash)
        .bind(sequencing)
        .bind(raw_tx)
        .bind(tx_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_events(&self, events: &[NewChainEvent]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for event in events {
            let result = sqlx::query(
                r#"INSERT INTO chain_events_tb
                   (chain_tx_id, log_index, actor, account_id, kind, action_id, op_id,
                    margin_before, margin_after)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (chain_tx_id, log_index) DO NOTHING"#,
            )
            .bind(&event.chain_tx_id)
            .bind(event.log_index)
            .bind(&event.actor)
            .bind(event.account_id)
            .bind(event.kind.id())
            .bind(event.action_id)
            .bind(&event.op_id)
            .bind(event.margin_before)
            .bind(event.margin_after)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn pending_events(&self, limit: i64) -> Result<Vec<ChainEventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT id, chain_tx_id, log_index, actor, account_id, kind, action_id, op_id,
                      margin_before, margin_after, validation
               FROM chain_events_tb
               WHERE validation = 'PENDING'
               ORDER BY id ASC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::event_from_row).collect()
    }

    async fn mark_event_success(&self, event_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE chain_events_tb SET validation = 'SUCCESS' WHERE id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn checkpoint(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let position: Option<i64> = sqlx::query_scalar(
            "SELECT position FROM settlement_checkpoints_tb WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(position)
    }

    async fn advance_checkpoint(&self, name: &str, position: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO settlement_checkpoints_tb (name, position)
               VALUES ($1, $2)
               ON CONFLICT (name) DO UPDATE
               SET position = EXCLUDED.position, updated_at = NOW()
               WHERE settlement_checkpoints_tb.position < EXCLUDED.position"#,
        )
        .bind(name)
        .bind(position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory store with the same semantics, for worker logic tests.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemStoreInner>,
}

#[derive(Default)]
struct MemStoreInner {
    actions: Vec<PendingAction>,
    next_action_id: i64,
    transactions: Vec<ChainTransaction>,
    next_tx_id: i64,
    events: Vec<ChainEventRecord>,
    next_event_id: i64,
    checkpoints: HashMap<String, i64>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action_count(&self) -> usize {
        self.inner.lock().unwrap().actions.len()
    }

    pub fn transaction(&self, tx_id: i64) -> Option<ChainTransaction> {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|t| t.id == tx_id)
            .cloned()
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }
}

#[async_trait]
impl SettlementStore for MemStore {
    async fn insert_actions(&self, actions: &[NewAction]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0u64;
        for action in actions {
            let duplicate = inner
                .actions
                .iter()
                .any(|a| a.kind == action.kind && a.source_id == action.source_id);
            if duplicate {
                continue;
            }
            inner.next_action_id += 1;
            let id = inner.next_action_id;
            inner.actions.push(PendingAction {
                id,
                kind: action.kind,
                source_id: action.source_id,
                source_offset: action.source_offset,
                raw_payload: action.raw_payload.clone(),
                params: action.params.clone(),
                tx_ref: 0,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn unassigned_actions(&self, limit: i64) -> Result<Vec<PendingAction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.tx_ref == 0)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn actions_for_tx(&self, tx_id: i64) -> Result<Vec<PendingAction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .actions
            .iter()
            .filter(|a| a.tx_ref == tx_id)
            .cloned()
            .collect())
    }

    async fn unresolved_count(&self) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.status.is_unresolved())
            .count() as i64)
    }

    async fn first_reverted(&self) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .iter()
            .find(|t| t.status == TxStatus::Revert)
            .map(|t| t.id))
    }

    async fn persist_transaction(
        &self,
        tx: &NewTransaction,
        action_ids: &[i64],
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let matched = inner
            .actions
            .iter()
            .filter(|a| action_ids.contains(&a.id) && a.tx_ref == 0)
            .count() as u64;
        if matched != action_ids.len() as u64 {
            return Err(StoreError::PartialAssignment {
                expected: action_ids.len(),
                matched,
            });
        }

        inner.next_tx_id += 1;
        let tx_id = inner.next_tx_id;
        inner.transactions.push(ChainTransaction {
            id: tx_id,
            tx_hash: tx.tx_hash.clone(),
            signer: tx.signer.clone(),
            sequencing: tx.sequencing,
            raw_tx: tx.raw_tx.clone(),
            status: TxStatus::Pending,
            resigned: false,
            created_at: Utc::now(),
        });
        for action in inner.actions.iter_mut() {
            if action_ids.contains(&action.id) {
                action.tx_ref = tx_id;
            }
        }
        Ok(tx_id)
    }

    async fn transactions_with_status(
        &self,
        status: TxStatus,
    ) -> Result<Vec<ChainTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn update_tx_status(
        &self,
        tx_id: i64,
        from: TxStatus,
        to: TxStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for tx in inner.transactions.iter_mut() {
            if tx.id == tx_id && tx.status == from {
                tx.status = to;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn resign_transaction(
        &self,
        tx_id: i64,
        tx_hash: &str,
        sequencing: i64,
        raw_tx: &[u8],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for tx in inner.transactions.iter_mut() {
            if tx.id == tx_id && tx.status == TxStatus::Pending {
                tx.tx_hash = tx_hash.to_string();
                tx.sequencing = sequencing;
                tx.raw_tx = raw_tx.to_vec();
                tx.resigned = true;
            }
        }
        Ok(())
    }

    async fn insert_events(&self, events: &[NewChainEvent]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut inserted = 0u64;
        for event in events {
            let duplicate = inner
                .events
                .iter()
                .any(|e| e.chain_tx_id == event.chain_tx_id && e.log_index == event.log_index);
            if duplicate {
                continue;
            }
            inner.next_event_id += 1;
            let id = inner.next_event_id;
            inner.events.push(ChainEventRecord {
                id,
                chain_tx_id: event.chain_tx_id.clone(),
                log_index: event.log_index,
                actor: event.actor.clone(),
                account_id: event.account_id,
                kind: event.kind,
                action_id: event.action_id,
                op_id: event.op_id.clone(),
                margin_before: event.margin_before,
                margin_after: event.margin_after,
                validation: ValidationStatus::Pending,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn pending_events(&self, limit: i64) -> Result<Vec<ChainEventRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.validation == ValidationStatus::Pending)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_event_success(&self, event_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for event in inner.events.iter_mut() {
            if event.id == event_id {
                event.validation = ValidationStatus::Success;
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.checkpoints.get(name).copied())
    }

    async fn advance_checkpoint(&self, name: &str, position: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.checkpoints.entry(name.to_string()).or_insert(0);
        if position > *entry {
            *entry = position;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::types::{SettlementParams, Side};
    use uuid::Uuid;

    fn new_action(source_id: i64) -> NewAction {
        NewAction {
            kind: ActionKind::Trade,
            source_id,
            source_offset: 1,
            raw_payload: serde_json::json!({"trade_id": source_id}),
            params: SettlementParams::Trade {
                account_id: 1,
                address: "0xaaa".to_string(),
                instrument_id: 1,
                side: Side::Buy,
                price_fp: 1,
                qty_fp: 1,
                fee_fp: 0,
                margin_fp: 100_000_000,
                bankrupt_price_fp: None,
                op_id: Uuid::new_v4(),
            },
        }
    }

    fn new_tx(hash: &str, seq: i64) -> NewTransaction {
        NewTransaction {
            tx_hash: hash.to_string(),
            signer: "0xsigner".to_string(),
            sequencing: seq,
            raw_tx: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_insert_actions_idempotent() {
        let store = MemStore::new();
        assert_eq!(store.insert_actions(&[new_action(1), new_action(2)]).await.unwrap(), 2);
        // Re-ingesting the same source ids inserts nothing
        assert_eq!(store.insert_actions(&[new_action(1), new_action(2)]).await.unwrap(), 0);
        assert_eq!(store.action_count(), 2);
    }

    #[tokio::test]
    async fn test_assignment_is_all_or_nothing() {
        let store = MemStore::new();
        store.insert_actions(&[new_action(1), new_action(2)]).await.unwrap();
        let actions = store.unassigned_actions(10).await.unwrap();
        let ids: Vec<i64> = actions.iter().map(|a| a.id).collect();

        let tx_id = store.persist_transaction(&new_tx("0x01", 1), &ids).await.unwrap();
        assert!(store.unassigned_actions(10).await.unwrap().is_empty());

        // Second attempt to claim the same actions must fail atomically
        let err = store.persist_transaction(&new_tx("0x02", 2), &ids).await;
        assert!(matches!(err, Err(StoreError::PartialAssignment { matched: 0, .. })));

        // Assignment never changes once set
        for action in store.actions_for_tx(tx_id).await.unwrap() {
            assert_eq!(action.tx_ref, tx_id);
        }
    }

    #[tokio::test]
    async fn test_status_cas() {
        let store = MemStore::new();
        store.insert_actions(&[new_action(1)]).await.unwrap();
        let ids: Vec<i64> = store.unassigned_actions(1).await.unwrap().iter().map(|a| a.id).collect();
        let tx_id = store.persist_transaction(&new_tx("0x01", 1), &ids).await.unwrap();

        assert!(store.update_tx_status(tx_id, TxStatus::Pending, TxStatus::Sent).await.unwrap());
        // Stale CAS does nothing
        assert!(!store.update_tx_status(tx_id, TxStatus::Pending, TxStatus::Sent).await.unwrap());
        assert!(store.update_tx_status(tx_id, TxStatus::Sent, TxStatus::Success).await.unwrap());
        assert_eq!(store.unresolved_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_event_insert_idempotent() {
        let store = MemStore::new();
        let event = NewChainEvent {
            chain_tx_id: "0xdead".to_string(),
            log_index: 0,
            actor: "0xaaa".to_string(),
            account_id: 1,
            kind: ActionKind::Trade,
            action_id: 1,
            op_id: "op-1".to_string(),
            margin_before: 500.into(),
            margin_after: 600.into(),
        };
        assert_eq!(store.insert_events(&[event.clone()]).await.unwrap(), 1);
        assert_eq!(store.insert_events(&[event]).await.unwrap(), 0);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_monotonic() {
        let store = MemStore::new();
        assert_eq!(store.checkpoint("c").await.unwrap(), None);
        store.advance_checkpoint("c", 10).await.unwrap();
        store.advance_checkpoint("c", 5).await.unwrap();
        assert_eq!(store.checkpoint("c").await.unwrap(), Some(10));
    }
}
