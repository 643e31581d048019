//! Alternate-chain integration (slot/signature model).
//!
//! Sequencing is slot-relative rather than an account counter, receipts are
//! signature statuses, and event discovery pages the program's signature
//! list instead of scanning block ranges. Settlement events arrive as
//! base64 program-log payloads decoded by hand.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{ChainRpc, CodecError, RpcError, SettlementEvent, TxCodec, TxReceipt};
use crate::action::types::{ActionKind, PendingAction, SettlementParams};

const EVENT_LOG_PREFIX: &str = "Program data: ";
const SIGNATURE_PAGE_LIMIT: usize = 1000;

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct StatusesResult {
    value: Vec<Option<SigStatus>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SigStatus {
    err: Option<serde_json::Value>,
    confirmation_status: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SigInfo {
    signature: String,
    slot: u64,
    err: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct TxResult {
    meta: Option<TxMeta>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TxMeta {
    log_messages: Option<Vec<String>>,
}

pub struct SolRpc {
    client: reqwest::Client,
    url: String,
    program: String,
}

impl SolRpc {
    pub fn new(url: &str, program: &str) -> Result<Self, RpcError> {
        info!("Initializing SOL RPC client at {}", url);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            program: program.to_string(),
        })
    }

    async fn rpc_call<T, R>(&self, method: &'static str, params: T) -> Result<R, RpcError>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("HTTP request failed: {}", e)))?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = rpc_response.error {
            return Err(RpcError::Rejected(format!(
                "RPC error {}: {}",
                error.code, error.message
            )));
        }

        rpc_response
            .result
            .ok_or_else(|| RpcError::Transport("No result in RPC response".to_string()))
    }

    /// Signatures for the program whose slot falls in `from..=to`, paging
    /// backwards from the newest.
    async fn signatures_in_window(&self, from: u64, to: u64) -> Result<Vec<SigInfo>, RpcError> {
        let mut collected = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let opts = match &before {
                Some(cursor) => json!({ "limit": SIGNATURE_PAGE_LIMIT, "before": cursor }),
                None => json!({ "limit": SIGNATURE_PAGE_LIMIT }),
            };
            let page: Vec<SigInfo> = self
                .rpc_call(
                    "getSignaturesForAddress",
                    (self.program.clone(), opts),
                )
                .await?;
            if page.is_empty() {
                break;
            }

            let mut passed_window = false;
            before = page.last().map(|s| s.signature.clone());
            for info in page {
                if info.slot < from {
                    passed_window = true;
                    break;
                }
                if info.slot <= to && info.err.is_none() {
                    collected.push(info);
                }
            }
            if passed_window {
                break;
            }
        }

        // Oldest first, matching the block-range crawler's order
        collected.sort_by_key(|s| s.slot);
        Ok(collected)
    }
}

#[async_trait]
impl ChainRpc for SolRpc {
    fn chain_id(&self) -> &str {
        "SOL"
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, RpcError> {
        let encoded = BASE64.encode(raw_tx);
        self.rpc_call(
            "sendTransaction",
            (encoded, json!({ "encoding": "base64" })),
        )
        .await
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        let statuses: StatusesResult = self
            .rpc_call(
                "getSignatureStatuses",
                (vec![tx_hash], json!({ "searchTransactionHistory": true })),
            )
            .await?;
        let Some(Some(status)) = statuses.value.into_iter().next() else {
            return Ok(None);
        };
        if status.err.is_some() {
            return Ok(Some(TxReceipt { success: false }));
        }
        // Success only once finalized; anything earlier is "keep waiting"
        match status.confirmation_status.as_deref() {
            Some("finalized") => Ok(Some(TxReceipt { success: true })),
            _ => Ok(None),
        }
    }

    async fn next_sequencing_value(&self, _signer: &str) -> Result<u64, RpcError> {
        // Slot-relative sequencing; no per-account counter on this chain
        self.rpc_call("getSlot", json!([])).await
    }

    async fn head(&self) -> Result<u64, RpcError> {
        self.rpc_call("getSlot", json!([])).await
    }

    async fn settlement_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<SettlementEvent>, RpcError> {
        let signatures = self.signatures_in_window(from, to).await?;
        let mut events = Vec::new();

        for info in signatures {
            let tx: TxResult = self
                .rpc_call(
                    "getTransaction",
                    (info.signature.clone(), json!({ "encoding": "json" })),
                )
                .await?;
            let logs = tx.meta.and_then(|m| m.log_messages).unwrap_or_default();

            let mut log_index = 0i32;
            for line in logs {
                let Some(encoded) = line.strip_prefix(EVENT_LOG_PREFIX) else {
                    continue;
                };
                let payload = BASE64
                    .decode(encoded)
                    .map_err(|e| RpcError::Decode(format!("bad event payload base64: {}", e)))?;
                events.push(decode_event_payload(&payload, &info.signature, log_index)?);
                log_index += 1;
            }
        }
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

fn address_bytes(address: &str) -> Result<[u8; 32], CodecError> {
    let bytes = hex::decode(address)
        .map_err(|e| CodecError::Unencodable(format!("bad address {:?}: {}", address, e)))?;
    bytes.try_into().map_err(|_| {
        CodecError::Unencodable(format!("address {:?} is not 32 bytes", address))
    })
}

fn encode_instruction(action: &PendingAction) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    match &action.params {
        SettlementParams::Trade {
            address,
            instrument_id,
            side,
            price_fp,
            qty_fp,
            fee_fp,
            margin_fp,
            bankrupt_price_fp,
            op_id,
            ..
        } => {
            out.push(ActionKind::Trade.id() as u8);
            out.extend_from_slice(&address_bytes(address)?);
            out.extend_from_slice(&(*instrument_id as u32).to_le_bytes());
            out.push(side.id() as u8);
            out.extend_from_slice(&price_fp.to_le_bytes());
            out.extend_from_slice(&qty_fp.to_le_bytes());
            out.extend_from_slice(&fee_fp.to_le_bytes());
            out.extend_from_slice(&margin_fp.to_le_bytes());
            out.push(u8::from(bankrupt_price_fp.is_some()));
            out.extend_from_slice(&bankrupt_price_fp.unwrap_or(0).to_le_bytes());
            out.extend_from_slice(&(action.source_id as u64).to_le_bytes());
            out.extend_from_slice(op_id.as_bytes());
        }
        SettlementParams::Withdraw {
            address,
            amount_fp,
            op_id,
            ..
        } => {
            out.push(ActionKind::Withdraw.id() as u8);
            out.extend_from_slice(&address_bytes(address)?);
            out.extend_from_slice(&amount_fp.to_le_bytes());
            out.extend_from_slice(&(action.source_id as u64).to_le_bytes());
            out.extend_from_slice(op_id.as_bytes());
        }
        SettlementParams::Funding {
            address,
            instrument_id,
            amount_fp,
            op_id,
            ..
        } => {
            out.push(ActionKind::Funding.id() as u8);
            out.extend_from_slice(&address_bytes(address)?);
            out.extend_from_slice(&(*instrument_id as u32).to_le_bytes());
            out.extend_from_slice(&amount_fp.to_le_bytes());
            out.extend_from_slice(&(action.source_id as u64).to_le_bytes());
            out.extend_from_slice(op_id.as_bytes());
        }
    }
    Ok(out)
}

/// Event payload layout emitted by the settlement program:
/// kind u8 | actor [32] | action_id u64 | op_id [16] | margin_before i128 |
/// margin_after i128, all little-endian. 89 bytes total.
pub fn decode_event_payload(
    payload: &[u8],
    signature: &str,
    log_index: i32,
) -> Result<SettlementEvent, RpcError> {
    const EVENT_LEN: usize = 1 + 32 + 8 + 16 + 16 + 16;
    if payload.len() != EVENT_LEN {
        return Err(RpcError::Decode(format!(
            "event payload is {} bytes, expected {}",
            payload.len(),
            EVENT_LEN
        )));
    }

    let kind = ActionKind::from_id(payload[0] as i16)
        .ok_or_else(|| RpcError::Decode(format!("unknown action kind {}", payload[0])))?;
    let actor = hex::encode(&payload[1..33]);
    let action_id = u64::from_le_bytes(payload[33..41].try_into().expect("8 bytes")) as i64;
    let op_id = hex::encode(&payload[41..57]);
    let margin_before_fp = i128::from_le_bytes(payload[57..73].try_into().expect("16 bytes"));
    let margin_after_fp = i128::from_le_bytes(payload[73..89].try_into().expect("16 bytes"));

    Ok(SettlementEvent {
        chain_tx_id: signature.to_string(),
        log_index,
        actor,
        kind,
        action_id,
        op_id,
        margin_before_fp,
        margin_after_fp,
    })
}

/// Packs instructions into one transaction message under the chain's
/// byte-size ceiling. Batch sizes are kept conservative upstream; a single
/// oversize chunk is a hard error, never silently split or truncated.
pub struct SolCodec {
    ceiling: usize,
}

impl SolCodec {
    pub fn new(ceiling: usize) -> Self {
        Self { ceiling }
    }
}

impl TxCodec for SolCodec {
    fn counter_sequencing(&self) -> bool {
        false
    }

    fn encode_batch(
        &self,
        actions: &[PendingAction],
        sequencing: u64,
    ) -> Result<Vec<u8>, CodecError> {
        let mut message = Vec::new();
        message.extend_from_slice(&sequencing.to_le_bytes());
        message.extend_from_slice(&(actions.len() as u16).to_le_bytes());
        for action in actions {
            let instruction = encode_instruction(action)?;
            message.extend_from_slice(&(instruction.len() as u16).to_le_bytes());
            message.extend_from_slice(&instruction);
        }

        if message.len() > self.ceiling {
            return Err(CodecError::Oversize {
                size: message.len(),
                ceiling: self.ceiling,
            });
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::types::Side;
    use uuid::Uuid;

    fn sol_address() -> String {
        "11".repeat(32)
    }

    fn withdraw_action(id: i64) -> PendingAction {
        PendingAction {
            id,
            kind: ActionKind::Withdraw,
            source_id: 7,
            source_offset: 1,
            raw_payload: serde_json::Value::Null,
            params: SettlementParams::Withdraw {
                account_id: 1,
                address: sol_address(),
                amount_fp: 5_500_000,
                op_id: Uuid::nil(),
            },
            tx_ref: 0,
        }
    }

    fn trade_action(id: i64) -> PendingAction {
        PendingAction {
            id,
            kind: ActionKind::Trade,
            source_id: id,
            source_offset: 1,
            raw_payload: serde_json::Value::Null,
            params: SettlementParams::Trade {
                account_id: 1,
                address: sol_address(),
                instrument_id: 2,
                side: Side::Buy,
                price_fp: 1,
                qty_fp: 1,
                fee_fp: 1,
                margin_fp: 1,
                bankrupt_price_fp: Some(99),
                op_id: Uuid::nil(),
            },
            tx_ref: 0,
        }
    }

    #[test]
    fn test_encode_batch_layout() {
        let codec = SolCodec::new(1232);
        let message = codec.encode_batch(&[withdraw_action(1)], 777).unwrap();
        assert_eq!(u64::from_le_bytes(message[..8].try_into().unwrap()), 777);
        assert_eq!(u16::from_le_bytes(message[8..10].try_into().unwrap()), 1);
    }

    #[test]
    fn test_oversize_batch_is_error() {
        let codec = SolCodec::new(100);
        let actions: Vec<PendingAction> = (1..=4).map(trade_action).collect();
        assert!(matches!(
            codec.encode_batch(&actions, 1),
            Err(CodecError::Oversize { .. })
        ));
    }

    #[test]
    fn test_rejects_non_32_byte_address() {
        let codec = SolCodec::new(1232);
        let mut action = withdraw_action(1);
        action.params = SettlementParams::Withdraw {
            account_id: 1,
            address: "1234".to_string(),
            amount_fp: 1,
            op_id: Uuid::nil(),
        };
        assert!(matches!(
            codec.encode_batch(&[action], 1),
            Err(CodecError::Unencodable(_))
        ));
    }

    #[test]
    fn test_event_payload_round_trip() {
        let mut payload = Vec::new();
        payload.push(3u8); // FUNDING
        payload.extend_from_slice(&[0x22u8; 32]);
        payload.extend_from_slice(&99u64.to_le_bytes());
        payload.extend_from_slice(Uuid::nil().as_bytes());
        payload.extend_from_slice(&(-250_000i128).to_le_bytes());
        payload.extend_from_slice(&(-500_000i128).to_le_bytes());

        let event = decode_event_payload(&payload, "sig1", 0).unwrap();
        assert_eq!(event.kind, ActionKind::Funding);
        assert_eq!(event.action_id, 99);
        assert_eq!(event.actor, "22".repeat(32));
        assert_eq!(event.margin_before_fp, -250_000);
        assert_eq!(event.margin_after_fp, -500_000);
    }

    #[test]
    fn test_truncated_event_payload_is_error() {
        assert!(matches!(
            decode_event_payload(&[1, 2, 3], "sig1", 0),
            Err(RpcError::Decode(_))
        ));
    }
}
