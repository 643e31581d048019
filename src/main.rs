//! chain-settler entry point.
//!
//! Wires the five workers around one settlement chain chosen by config and
//! runs them until the first fatal error. Workers share nothing but the
//! store, so a halted worker leaves the others' state consistent; the
//! process still exits non-zero so the orchestrator and the on-call both
//! notice.

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{error, info};

use chain_settler::action::translator::ActionTranslator;
use chain_settler::cache::AddressCache;
use chain_settler::chain::evm::{EvmCodec, EvmRpc, NodeSigner};
use chain_settler::chain::signer::{Ed25519Signer, TxSigner};
use chain_settler::chain::sol::{SolCodec, SolRpc};
use chain_settler::chain::{ChainRpc, SequencingCounter, TxCodec};
use chain_settler::config::AppConfig;
use chain_settler::crawler::ChainCrawler;
use chain_settler::db::Database;
use chain_settler::ledger::PgLedger;
use chain_settler::logging::init_logging;
use chain_settler::reconciler::Reconciler;
use chain_settler::source::{EventSource, PgOutboxSource};
use chain_settler::submitter::BatchSubmitter;
use chain_settler::tracker::LifecycleTracker;
use chain_settler::{LedgerReader, PgStore, SettlementStore};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

struct WiredChain {
    name: &'static str,
    rpc: Arc<dyn ChainRpc>,
    codec: Arc<dyn TxCodec>,
    signer: Arc<dyn TxSigner>,
    checkpoint: String,
    confirmation_depth: u64,
    max_window: u64,
}

fn wire_chain(config: &AppConfig) -> anyhow::Result<WiredChain> {
    let evm = config.chains.evm.as_ref().filter(|c| c.enabled);
    let sol = config.chains.sol.as_ref().filter(|c| c.enabled);

    match (evm, sol) {
        (Some(_), Some(_)) => bail!("Exactly one settlement chain may be enabled"),
        (None, None) => bail!("No settlement chain enabled"),
        (Some(c), None) => Ok(WiredChain {
            name: "EVM",
            rpc: Arc::new(EvmRpc::new(&c.rpc_url, &c.contract)?),
            codec: Arc::new(EvmCodec),
            signer: Arc::new(NodeSigner::new(&c.rpc_url, &c.contract, &c.signer_address)?),
            checkpoint: c.checkpoint.clone(),
            confirmation_depth: c.confirmation_depth,
            max_window: c.max_window,
        }),
        (None, Some(c)) => {
            // Seed stays out of config files
            let seed_hex = std::env::var("SOL_SIGNER_SEED")
                .context("SOL_SIGNER_SEED env var is required for the SOL chain")?;
            let seed: [u8; 32] = hex::decode(seed_hex.trim())
                .context("SOL_SIGNER_SEED is not valid hex")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("SOL_SIGNER_SEED must be 32 bytes"))?;
            Ok(WiredChain {
                name: "SOL",
                rpc: Arc::new(SolRpc::new(&c.rpc_url, &c.program)?),
                codec: Arc::new(SolCodec::new(c.tx_byte_ceiling)),
                signer: Arc::new(Ed25519Signer::from_seed(&seed)),
                checkpoint: c.checkpoint.clone(),
                confirmation_depth: c.confirmation_depth,
                max_window: c.max_window,
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _log_guard = init_logging(&config);

    info!(
        "Starting chain-settler {} ({}) in {} env",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env
    );

    let db = Database::connect(&config.database.url)
        .await
        .context("Database connection failed")?;
    db.ensure_schema().await.context("Schema setup failed")?;
    db.health_check().await.context("Database health check failed")?;

    let chain = wire_chain(&config)?;
    info!(chain = chain.name, signer = chain.signer.address(), "Chain wired");

    let store: Arc<dyn SettlementStore> = Arc::new(PgStore::new(db.pool().clone()));
    let source: Arc<dyn EventSource> = Arc::new(PgOutboxSource::new(db.pool().clone()));
    let ledger: Arc<dyn LedgerReader> = Arc::new(PgLedger::new(db.pool().clone(), chain.name));
    let cache = Arc::new(AddressCache::new(ledger.clone()));

    let translator = ActionTranslator::new(
        store.clone(),
        source,
        cache.clone(),
        &config.pipeline,
        &config.source,
    );
    // Shared between submitter and resend guard: a re-sign consumes a
    // sequencing value, so the submitter's cached copy must be dropped
    let counter = Arc::new(SequencingCounter::new());
    let submitter = BatchSubmitter::new(
        store.clone(),
        chain.rpc.clone(),
        chain.codec.clone(),
        chain.signer.clone(),
        counter.clone(),
        &config.pipeline,
    );
    let tracker = LifecycleTracker::new(
        store.clone(),
        chain.rpc.clone(),
        chain.codec.clone(),
        chain.signer.clone(),
        counter,
        &config.pipeline,
    );
    let crawler = ChainCrawler::new(
        store.clone(),
        chain.rpc.clone(),
        cache,
        &chain.checkpoint,
        chain.confirmation_depth,
        chain.max_window,
        &config.pipeline,
    );
    let reconciler = Reconciler::new(store, ledger, &config.pipeline);

    // The translator only ever retries; the rest stop on fatal errors
    let translate_task = tokio::spawn(async move { translator.run().await });
    let mut submit_task = tokio::spawn(async move { submitter.run().await });
    let mut track_task = tokio::spawn(async move { tracker.run().await });
    let mut crawl_task = tokio::spawn(async move { crawler.run().await });
    let mut reconcile_task = tokio::spawn(async move { reconciler.run().await });

    let failure: anyhow::Error = tokio::select! {
        r = &mut submit_task => match r {
            Ok(Err(e)) => e.into(),
            Ok(Ok(())) => anyhow::anyhow!("Submitter exited unexpectedly"),
            Err(e) => e.into(),
        },
        r = &mut track_task => match r {
            Ok(Err(e)) => e.into(),
            Ok(Ok(())) => anyhow::anyhow!("Tracker exited unexpectedly"),
            Err(e) => e.into(),
        },
        r = &mut crawl_task => match r {
            Ok(Err(e)) => e.into(),
            Ok(Ok(())) => anyhow::anyhow!("Crawler exited unexpectedly"),
            Err(e) => e.into(),
        },
        r = &mut reconcile_task => match r {
            Ok(Err(e)) => e.into(),
            Ok(Ok(())) => anyhow::anyhow!("Reconciler exited unexpectedly"),
            Err(e) => e.into(),
        },
    };

    error!("Settlement pipeline stopped: {}", failure);
    translate_task.abort();
    submit_task.abort();
    track_task.abort();
    crawl_task.abort();
    reconcile_task.abort();
    Err(failure)
}
