//! chain-settler - Off-chain ledger to on-chain settlement pipeline
//!
//! Bridges a trading ledger (trades, withdrawals, funding payments) with
//! settlement contracts on two chains. Architecture:
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │ Translator │──▶│  Action  │──▶│ Submitter │──▶│ Tracker  │
//! │ (ingest)   │   │  Store   │   │ (batch+   │   │ (status) │
//! └────────────┘   └──────────┘   │  sign)    │   └──────────┘
//!                                 └───────────┘
//! ┌────────────┐   ┌────────────┐
//! │  Crawler   │──▶│ Reconciler │   (independent read side: chain events
//! │ (windows)  │   │ (epsilon)  │    cross-checked against the ledger)
//! └────────────┘   └────────────┘
//! ```
//!
//! Workers never call each other; all coordination goes through the store
//! tables. Any condition that could mean "money moved incorrectly" is fatal
//! and stops the owning worker loop.

pub mod config;
pub mod logging;

pub mod db;

pub mod cache;
pub mod ledger;
pub mod scale;
pub mod source;

pub mod action;
pub mod chain;

pub mod crawler;
pub mod reconciler;
pub mod submitter;
pub mod tracker;

// Convenient re-exports at crate root
pub use action::store::{MemStore, PgStore, SettlementStore, StoreError};
pub use action::translator::{ActionTranslator, TranslateError};
pub use action::types::{
    ActionKind, ChainEventRecord, ChainTransaction, NewAction, NewChainEvent, NewTransaction,
    PendingAction, SettlementParams, Side, TxStatus, ValidationStatus,
};
pub use cache::AddressCache;
pub use chain::{
    ChainRpc, CodecError, MockChainRpc, MockCodec, RpcError, SettlementEvent, TxCodec, TxReceipt,
};
pub use crawler::{ChainCrawler, CrawlError};
pub use ledger::{LedgerError, LedgerReader, MemLedger, PgLedger};
pub use reconciler::{ReconcileError, Reconciler};
pub use source::{DomainEvent, EventSource, MemEventSource, PgOutboxSource, SourceError};
pub use submitter::{BatchSubmitter, SubmitError};
pub use tracker::{LifecycleTracker, ResendGuard, TrackError};
