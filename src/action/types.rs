//! Core settlement pipeline types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What kind of off-chain event an action settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Trade,
    Withdraw,
    Funding,
}

impl ActionKind {
    pub fn id(&self) -> i16 {
        match self {
            ActionKind::Trade => 1,
            ActionKind::Withdraw => 2,
            ActionKind::Funding => 3,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(ActionKind::Trade),
            2 => Some(ActionKind::Withdraw),
            3 => Some(ActionKind::Funding),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Trade => write!(f, "TRADE"),
            ActionKind::Withdraw => write!(f, "WITHDRAW"),
            ActionKind::Funding => write!(f, "FUNDING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn id(&self) -> i16 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

/// Chain-specific parameters of one settlement call, already fixed-point
/// converted. One variant per action kind, matched exhaustively; the store
/// treats this as an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementParams {
    Trade {
        account_id: i64,
        address: String,
        instrument_id: i32,
        side: Side,
        price_fp: i128,
        qty_fp: i128,
        fee_fp: i128,
        margin_fp: i128,
        /// Present only on liquidation legs
        bankrupt_price_fp: Option<i128>,
        op_id: Uuid,
    },
    Withdraw {
        account_id: i64,
        address: String,
        amount_fp: i128,
        op_id: Uuid,
    },
    Funding {
        account_id: i64,
        address: String,
        instrument_id: i32,
        amount_fp: i128,
        op_id: Uuid,
    },
}

impl SettlementParams {
    pub fn kind(&self) -> ActionKind {
        match self {
            SettlementParams::Trade { .. } => ActionKind::Trade,
            SettlementParams::Withdraw { .. } => ActionKind::Withdraw,
            SettlementParams::Funding { .. } => ActionKind::Funding,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            SettlementParams::Trade { address, .. } => address,
            SettlementParams::Withdraw { address, .. } => address,
            SettlementParams::Funding { address, .. } => address,
        }
    }
}

/// One off-chain event awaiting settlement. `tx_ref == 0` means unassigned;
/// once non-zero it never changes.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub id: i64,
    pub kind: ActionKind,
    pub source_id: i64,
    pub source_offset: i64,
    pub raw_payload: serde_json::Value,
    pub params: SettlementParams,
    pub tx_ref: i64,
}

/// Insert form of a PendingAction (id assigned by the store).
#[derive(Debug, Clone)]
pub struct NewAction {
    pub kind: ActionKind,
    pub source_id: i64,
    pub source_offset: i64,
    pub raw_payload: serde_json::Value,
    pub params: SettlementParams,
}

/// Transaction lifecycle. Transitions are one-directional:
/// PENDING -> SENT -> {SUCCESS, REVERT}. REVERT is terminal and blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Sent,
    Success,
    Revert,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "PENDING",
            TxStatus::Sent => "SENT",
            TxStatus::Success => "SUCCESS",
            TxStatus::Revert => "REVERT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TxStatus::Pending),
            "SENT" => Some(TxStatus::Sent),
            "SUCCESS" => Some(TxStatus::Success),
            "REVERT" => Some(TxStatus::Revert),
            _ => None,
        }
    }

    /// PENDING or SENT: still counts against the in-flight budget.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, TxStatus::Pending | TxStatus::Sent)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One signed, submitted batch of actions.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub id: i64,
    pub tx_hash: String,
    pub signer: String,
    pub sequencing: i64,
    pub raw_tx: Vec<u8>,
    pub status: TxStatus,
    /// The hash/bytes may be reassigned exactly once; set when that
    /// happens so a second rejection halts instead of re-signing again.
    pub resigned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub tx_hash: String,
    pub signer: String,
    pub sequencing: i64,
    pub raw_tx: Vec<u8>,
}

/// Reconciliation state of a crawled chain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Pending,
    Success,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "PENDING",
            ValidationStatus::Success => "SUCCESS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ValidationStatus::Pending),
            "SUCCESS" => Some(ValidationStatus::Success),
            _ => None,
        }
    }
}

/// One settlement event observed on-chain, unique per
/// (chain transaction id, log index).
#[derive(Debug, Clone)]
pub struct ChainEventRecord {
    pub id: i64,
    pub chain_tx_id: String,
    pub log_index: i32,
    pub actor: String,
    pub account_id: i64,
    pub kind: ActionKind,
    pub action_id: i64,
    pub op_id: String,
    pub margin_before: Decimal,
    pub margin_after: Decimal,
    pub validation: ValidationStatus,
}

#[derive(Debug, Clone)]
pub struct NewChainEvent {
    pub chain_tx_id: String,
    pub log_index: i32,
    pub actor: String,
    pub account_id: i64,
    pub kind: ActionKind,
    pub action_id: i64,
    pub op_id: String,
    pub margin_before: Decimal,
    pub margin_after: Decimal,
}
