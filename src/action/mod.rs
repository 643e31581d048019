//! Pending settlement actions: types, durable store, and the translator
//! that turns upstream domain events into idempotent action rows.

pub mod store;
pub mod translator;
pub mod types;

pub use store::{MemStore, PgStore, SettlementStore, StoreError};
pub use translator::{ActionTranslator, TranslateError};
pub use types::{
    ActionKind, ChainEventRecord, ChainTransaction, NewAction, NewChainEvent, NewTransaction,
    PendingAction, SettlementParams, Side, TxStatus, ValidationStatus,
};
