//! EVM chain integration via JSON-RPC.
//!
//! The settlement contract exposes one entry point per action kind plus a
//! multicall wrapper; a batch becomes a single multicall transaction. Events
//! are fetched with `eth_getLogs` over block ranges and decoded from 32-byte
//! ABI words by hand.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::signer::{SignError, SignedTx, TxSigner, UnsignedTx};
use super::{ChainRpc, CodecError, RpcError, SettlementEvent, TxCodec, TxReceipt};
use crate::action::types::{ActionKind, PendingAction, SettlementParams};

/// keccak256("Settlement(address,uint8,uint64,bytes16,uint128,uint128)")
pub const SETTLEMENT_TOPIC: &str =
    "0x7a3c5b9f1d0e4a8621c96f0b5d83e7aa40912cc3de5f6071b8a49d02e1f5c638";

// Contract function selectors
const SELECTOR_SETTLE_TRADE: [u8; 4] = [0x3f, 0xa4, 0xf2, 0x45];
const SELECTOR_SETTLE_WITHDRAW: [u8; 4] = [0x8e, 0x1a, 0x55, 0xfc];
const SELECTOR_SETTLE_FUNDING: [u8; 4] = [0xb1, 0x7d, 0x6c, 0x09];
const SELECTOR_MULTICALL: [u8; 4] = [0xac, 0x96, 0x50, 0xd8];

/// JSON-RPC request structure
#[derive(Serialize)]
struct JsonRpcRequest<T> {
    jsonrpc: &'static str,
    method: &'static str,
    params: T,
    id: u64,
}

/// JSON-RPC response structure
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
#[serde(rename_all = "camelCase")]
struct EthReceipt {
    status: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthLog {
    transaction_hash: String,
    log_index: String,
    topics: Vec<String>,
    data: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SignTransactionResult {
    raw: String,
    tx: SignedTxFields,
}

#[derive(Deserialize, Debug)]
struct SignedTxFields {
    hash: String,
}

pub struct EvmRpc {
    client: reqwest::Client,
    url: String,
    contract: String,
}

impl EvmRpc {
    pub fn new(url: &str, contract: &str) -> Result<Self, RpcError> {
        info!("Initializing EVM RPC client at {}", url);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.to_string(),
            contract: contract.to_string(),
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

    /// Variant for methods whose result is legitimately null.
    async fn rpc_call_opt<T, R>(&self, method: &'static str, params: T) -> Result<Option<R>, RpcError>
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

        Ok(rpc_response.result)
    }
}

#[async_trait]
impl ChainRpc for EvmRpc {
    fn chain_id(&self) -> &str {
        "EVM"
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, RpcError> {
        let raw_hex = format!("0x{}", hex::encode(raw_tx));
        self.rpc_call("eth_sendRawTransaction", (raw_hex,)).await
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, RpcError> {
        let receipt: Option<EthReceipt> = self
            .rpc_call_opt("eth_getTransactionReceipt", (tx_hash,))
            .await?;
        Ok(receipt.map(|r| TxReceipt {
            success: r.status == "0x1",
        }))
    }

    async fn next_sequencing_value(&self, signer: &str) -> Result<u64, RpcError> {
        let count: String = self
            .rpc_call("eth_getTransactionCount", (signer, "pending"))
            .await?;
        parse_hex_u64(&count)
    }

    async fn head(&self) -> Result<u64, RpcError> {
        let number: String = self.rpc_call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&number)
    }

    async fn settlement_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<SettlementEvent>, RpcError> {
        let filter = json!({
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", to),
            "address": self.contract,
            "topics": [SETTLEMENT_TOPIC],
        });
        let logs: Vec<EthLog> = self.rpc_call("eth_getLogs", (filter,)).await?;
        logs.iter().map(decode_settlement_log).collect()
    }
}

/// Signer backed by the node's own account management
/// (`eth_signTransaction`); the key never enters this process.
pub struct NodeSigner {
    rpc: EvmRpc,
    address: String,
    contract: String,
}

impl NodeSigner {
    pub fn new(url: &str, contract: &str, address: &str) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: EvmRpc::new(url, contract)?,
            address: address.to_string(),
            contract: contract.to_string(),
        })
    }
}

#[async_trait]
impl TxSigner for NodeSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, unsigned: &UnsignedTx) -> Result<SignedTx, SignError> {
        let tx = json!({
            "from": self.address,
            "to": self.contract,
            "data": format!("0x{}", hex::encode(&unsigned.payload)),
            "nonce": format!("0x{:x}", unsigned.sequencing),
        });
        let result: SignTransactionResult = self
            .rpc
            .rpc_call("eth_signTransaction", (tx,))
            .await
            .map_err(|e| SignError::Failed(e.to_string()))?;
        let raw_tx = hex::decode(result.raw.trim_start_matches("0x"))
            .map_err(|e| SignError::Failed(format!("bad raw bytes from node: {}", e)))?;
        Ok(SignedTx {
            raw_tx,
            tx_hash: result.tx.hash,
        })
    }
}

fn parse_hex_u64(s: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Decode(format!("invalid hex quantity {:?}: {}", s, e)))
}

// ---------------------------------------------------------------------------
// ABI encoding
// ---------------------------------------------------------------------------

fn word_u128(v: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&v.to_be_bytes());
    word
}

fn word_i128(v: i128) -> [u8; 32] {
    // Two's complement with sign extension into the high 16 bytes
    let mut word = if v < 0 { [0xffu8; 32] } else { [0u8; 32] };
    word[16..].copy_from_slice(&v.to_be_bytes());
    word
}

fn word_u64(v: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&v.to_be_bytes());
    word
}

fn word_address(address: &str) -> Result<[u8; 32], CodecError> {
    let bytes = hex::decode(address.trim_start_matches("0x"))
        .map_err(|e| CodecError::Unencodable(format!("bad address {:?}: {}", address, e)))?;
    if bytes.len() != 20 {
        return Err(CodecError::Unencodable(format!(
            "address {:?} is {} bytes, expected 20",
            address,
            bytes.len()
        )));
    }
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

fn word_uuid(op_id: &uuid::Uuid) -> [u8; 32] {
    // bytes16, left-aligned per ABI
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(op_id.as_bytes());
    word
}

/// ABI-encode `bytes[]` for the multicall wrapper.
fn encode_bytes_array(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&word_u64(0x20)); // offset to the array
    out.extend_from_slice(&word_u64(items.len() as u64));

    // Per-element offsets, relative to the start of the element area
    let mut offset = 32 * items.len();
    for item in items {
        out.extend_from_slice(&word_u64(offset as u64));
        let padded = item.len().div_ceil(32) * 32;
        offset += 32 + padded;
    }

    for item in items {
        out.extend_from_slice(&word_u64(item.len() as u64));
        out.extend_from_slice(item);
        let padding = item.len().div_ceil(32) * 32 - item.len();
        out.extend_from_slice(&vec![0u8; padding]);
    }
    out
}

/// Encode one action as a single contract call.
fn encode_call(action: &PendingAction) -> Result<Vec<u8>, CodecError> {
    let mut call = Vec::new();
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
            call.extend_from_slice(&SELECTOR_SETTLE_TRADE);
            call.extend_from_slice(&word_address(address)?);
            call.extend_from_slice(&word_u64(*instrument_id as u64));
            call.extend_from_slice(&word_u64(side.id() as u64));
            call.extend_from_slice(&word_i128(*price_fp));
            call.extend_from_slice(&word_i128(*qty_fp));
            call.extend_from_slice(&word_i128(*fee_fp));
            call.extend_from_slice(&word_i128(*margin_fp));
            call.extend_from_slice(&word_i128(bankrupt_price_fp.unwrap_or(0)));
            call.extend_from_slice(&word_u64(u64::from(bankrupt_price_fp.is_some())));
            call.extend_from_slice(&word_u64(action.source_id as u64));
            call.extend_from_slice(&word_uuid(op_id));
        }
        SettlementParams::Withdraw {
            address,
            amount_fp,
            op_id,
            ..
        } => {
            call.extend_from_slice(&SELECTOR_SETTLE_WITHDRAW);
            call.extend_from_slice(&word_address(address)?);
            call.extend_from_slice(&word_i128(*amount_fp));
            call.extend_from_slice(&word_u64(action.source_id as u64));
            call.extend_from_slice(&word_uuid(op_id));
        }
        SettlementParams::Funding {
            address,
            instrument_id,
            amount_fp,
            op_id,
            ..
        } => {
            call.extend_from_slice(&SELECTOR_SETTLE_FUNDING);
            call.extend_from_slice(&word_address(address)?);
            call.extend_from_slice(&word_u64(*instrument_id as u64));
            call.extend_from_slice(&word_i128(*amount_fp));
            call.extend_from_slice(&word_u64(action.source_id as u64));
            call.extend_from_slice(&word_uuid(op_id));
        }
    }
    Ok(call)
}

/// Packs every action into one multicall transaction. Sequencing (the
/// account nonce) lives in the enclosing transaction, not in calldata.
pub struct EvmCodec;

impl TxCodec for EvmCodec {
    fn counter_sequencing(&self) -> bool {
        true
    }

    fn encode_batch(
        &self,
        actions: &[PendingAction],
        _sequencing: u64,
    ) -> Result<Vec<u8>, CodecError> {
        let calls: Vec<Vec<u8>> = actions
            .iter()
            .map(encode_call)
            .collect::<Result<_, _>>()?;
        let mut out = SELECTOR_MULTICALL.to_vec();
        out.extend_from_slice(&encode_bytes_array(&calls));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

fn decode_settlement_log(log: &EthLog) -> Result<SettlementEvent, RpcError> {
    if log.topics.len() < 2 {
        return Err(RpcError::Decode(format!(
            "settlement log in {} has {} topics, expected 2",
            log.transaction_hash,
            log.topics.len()
        )));
    }
    let actor_word = log.topics[1].trim_start_matches("0x");
    if actor_word.len() != 64 {
        return Err(RpcError::Decode(format!(
            "malformed actor topic {:?}",
            log.topics[1]
        )));
    }
    let actor = format!("0x{}", &actor_word[24..]);

    let data = log.data.trim_start_matches("0x");
    if data.len() != 5 * 64 {
        return Err(RpcError::Decode(format!(
            "settlement log data is {} hex chars, expected {}",
            data.len(),
            5 * 64
        )));
    }

    let kind_raw = decode_word_u128(&data[0..64])?;
    let kind = ActionKind::from_id(kind_raw as i16)
        .ok_or_else(|| RpcError::Decode(format!("unknown action kind {} in log", kind_raw)))?;
    let action_id = decode_word_u128(&data[64..128])? as i64;
    let op_id = data[128..160].to_string(); // bytes16, left-aligned
    let margin_before_fp = decode_word_i128(&data[192..256])?;
    let margin_after_fp = decode_word_i128(&data[256..320])?;

    Ok(SettlementEvent {
        chain_tx_id: log.transaction_hash.clone(),
        log_index: parse_hex_u64(&log.log_index)? as i32,
        actor,
        kind,
        action_id,
        op_id,
        margin_before_fp,
        margin_after_fp,
    })
}

fn decode_word_u128(word_hex: &str) -> Result<u128, RpcError> {
    if word_hex.len() != 64 {
        return Err(RpcError::Decode(format!(
            "word is {} hex chars, expected 64",
            word_hex.len()
        )));
    }
    // The high 16 bytes must be zero for all our uint fields
    if word_hex[..32].bytes().any(|b| b != b'0') {
        return Err(RpcError::Decode(format!(
            "word overflows u128: {}",
            word_hex
        )));
    }
    u128::from_str_radix(&word_hex[32..], 16)
        .map_err(|e| RpcError::Decode(format!("bad word {:?}: {}", word_hex, e)))
}

fn decode_word_i128(word_hex: &str) -> Result<i128, RpcError> {
    let raw = decode_word_u128(word_hex)?;
    i128::try_from(raw)
        .map_err(|_| RpcError::Decode(format!("word overflows i128: {}", word_hex)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::types::{ActionKind, Side};
    use uuid::Uuid;

    fn trade_action(id: i64) -> PendingAction {
        PendingAction {
            id,
            kind: ActionKind::Trade,
            source_id: 42,
            source_offset: 1,
            raw_payload: serde_json::Value::Null,
            params: SettlementParams::Trade {
                account_id: 1,
                address: "0x1111111111111111111111111111111111111111".to_string(),
                instrument_id: 2,
                side: Side::Sell,
                price_fp: 50_000_000_000,
                qty_fp: 1_000_000,
                fee_fp: 25_000,
                margin_fp: 100_000_000,
                bankrupt_price_fp: None,
                op_id: Uuid::nil(),
            },
            tx_ref: 0,
        }
    }

    #[test]
    fn test_word_encodings() {
        assert_eq!(word_u128(1)[31], 1);
        assert_eq!(word_u128(1)[..31], [0u8; 31]);

        let neg = word_i128(-1);
        assert_eq!(neg, [0xffu8; 32]);

        let addr = word_address("0x1111111111111111111111111111111111111111").unwrap();
        assert_eq!(addr[..12], [0u8; 12]);
        assert_eq!(addr[12], 0x11);
    }

    #[test]
    fn test_word_address_rejects_bad_length() {
        assert!(word_address("0x1234").is_err());
        assert!(word_address("not-hex").is_err());
    }

    #[test]
    fn test_bytes_array_layout() {
        let encoded = encode_bytes_array(&[vec![0xaa; 4], vec![0xbb; 36]]);
        // offset word + length word
        assert_eq!(encoded[31], 0x20);
        assert_eq!(encoded[63], 2);
        // first element offset: 2 words of offsets = 64
        assert_eq!(encoded[95], 64);
        // second element offset: 64 + (32 len + 32 padded) = 128
        assert_eq!(encoded[127], 128);
        // first element: length 4, data padded to 32
        assert_eq!(encoded[159], 4);
        assert_eq!(encoded[160], 0xaa);
        assert_eq!(encoded[164], 0x00);
        // total: head(64) + offsets(64) + (32+32) + (32+64)
        assert_eq!(encoded.len(), 64 + 64 + 64 + 96);
    }

    #[test]
    fn test_encode_batch_multicall() {
        let codec = EvmCodec;
        let one = codec.encode_batch(&[trade_action(1)], 0).unwrap();
        assert_eq!(&one[..4], &SELECTOR_MULTICALL);

        let two = codec
            .encode_batch(&[trade_action(1), trade_action(2)], 0)
            .unwrap();
        assert!(two.len() > one.len());
    }

    fn sample_log() -> EthLog {
        let mut data = String::new();
        data.push_str(&format!("{:064x}", 1u128)); // kind = TRADE
        data.push_str(&format!("{:064x}", 42u128)); // action id
        data.push_str(&"ab".repeat(16)); // op id (bytes16)
        data.push_str(&"0".repeat(32));
        data.push_str(&format!("{:064x}", 500_000_000u128)); // margin before
        data.push_str(&format!("{:064x}", 600_000_000u128)); // margin after
        EthLog {
            transaction_hash: "0xdeadbeef".to_string(),
            log_index: "0x2".to_string(),
            topics: vec![
                SETTLEMENT_TOPIC.to_string(),
                format!("0x{}{}", "0".repeat(24), "11".repeat(20)),
            ],
            data: format!("0x{}", data),
        }
    }

    #[test]
    fn test_decode_settlement_log() {
        let event = decode_settlement_log(&sample_log()).unwrap();
        assert_eq!(event.kind, ActionKind::Trade);
        assert_eq!(event.action_id, 42);
        assert_eq!(event.log_index, 2);
        assert_eq!(event.actor, format!("0x{}", "11".repeat(20)));
        assert_eq!(event.margin_before_fp, 500_000_000);
        assert_eq!(event.margin_after_fp, 600_000_000);
        assert_eq!(event.op_id, "ab".repeat(16));
    }

    #[test]
    fn test_decode_truncated_log_is_error() {
        let mut log = sample_log();
        log.data.truncate(log.data.len() - 2);
        assert!(matches!(
            decode_settlement_log(&log),
            Err(RpcError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_margin_over_i128_is_error() {
        let mut log = sample_log();
        // Overwrite the margin-after word with a value whose low 16 bytes
        // have the top bit set; a wrapping cast would read it as negative
        let data = log.data.trim_start_matches("0x").to_string();
        let oversized = format!("{}{:032x}", "0".repeat(32), u128::MAX);
        log.data = format!("0x{}{}", &data[..4 * 64], oversized);
        assert!(matches!(
            decode_settlement_log(&log),
            Err(RpcError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind_is_error() {
        let mut log = sample_log();
        // Overwrite the kind word with 9
        let data = log.data.trim_start_matches("0x").to_string();
        log.data = format!("0x{:064x}{}", 9u128, &data[64..]);
        assert!(matches!(
            decode_settlement_log(&log),
            Err(RpcError::Decode(_))
        ));
    }
}
