use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub chains: ChainsConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Knobs shared by every worker loop.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// At most this many transactions may be unresolved (PENDING | SENT)
    pub max_in_flight: i64,
    /// Actions per submitted transaction
    pub batch_size: i64,
    pub submit_interval_ms: u64,
    pub track_interval_ms: u64,
    /// Resend-guard sweep every K tracker iterations
    pub resend_every: u64,
    pub crawl_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub reconcile_batch: i64,
    /// Absolute tolerance for margin-delta reconciliation
    pub epsilon: String,
    pub withdraw_scale: u32,
    pub margin_scale: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            batch_size: 16,
            submit_interval_ms: 500,
            track_interval_ms: 500,
            resend_every: 20,
            crawl_interval_ms: 1000,
            reconcile_interval_ms: 1000,
            reconcile_batch: 20,
            epsilon: "0.000015".to_string(),
            withdraw_scale: 6,
            margin_scale: 6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChainsConfig {
    pub evm: Option<EvmChainConfig>,
    pub sol: Option<SolChainConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EvmChainConfig {
    pub enabled: bool,
    pub rpc_url: String,
    /// Settlement contract address (0x...)
    pub contract: String,
    /// Matcher wallet address; key custody is external
    pub signer_address: String,
    pub confirmation_depth: u64,
    pub max_window: u64,
    /// Named crawler checkpoint
    pub checkpoint: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SolChainConfig {
    pub enabled: bool,
    pub rpc_url: String,
    /// Settlement program id (base58)
    pub program: String,
    pub confirmation_depth: u64,
    pub max_window: u64,
    pub checkpoint: String,
    /// Hard ceiling on one serialized transaction
    pub tx_byte_ceiling: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceConfig {
    pub poll_interval_ms: u64,
    pub batch: i64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch: 50,
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialize() {
        let yaml = r#"
log_level: "info"
log_dir: "./logs"
log_file: "settler.log"
use_json: false
rotation: "daily"
database:
  url: "postgres://localhost/settler"
chains:
  evm:
    enabled: true
    rpc_url: "http://127.0.0.1:8545"
    contract: "0x1111111111111111111111111111111111111111"
    signer_address: "0x2222222222222222222222222222222222222222"
    confirmation_depth: 12
    max_window: 200
    checkpoint: "evm-settlement"
  sol: null
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.pipeline.max_in_flight, 8);
        assert_eq!(config.pipeline.epsilon, "0.000015");
        let evm = config.chains.evm.unwrap();
        assert!(evm.enabled);
        assert_eq!(evm.confirmation_depth, 12);
        assert!(config.chains.sol.is_none());
    }

    #[test]
    fn test_pipeline_defaults() {
        let p = PipelineConfig::default();
        assert_eq!(p.batch_size, 16);
        assert_eq!(p.resend_every, 20);
        assert_eq!(p.withdraw_scale, 6);
    }
}
