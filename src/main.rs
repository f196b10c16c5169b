//! snapllmd: daemon entry point for the model + context cache core.
//!
//! Loads configuration, opens the coordinator against a stub `INFER`
//! backend, and runs a short demonstration load/switch/generate cycle
//! while logging cache stats — there is no network-facing surface here,
//! the coordinator is meant to be embedded by whatever process owns the
//! real inference engine.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use snapllm_core::config::{Cli, Config};
use snapllm_core::weight::Domain;
use snapllm_core::{Coordinator, StubInferBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "snapllm_core=debug".to_string()
    } else {
        "snapllm_core=info".to_string()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("snapllm-core v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    info!(
        workspace = %config.workspace_root.display(),
        quant_scheme = %config.weight_cache.quant_scheme_tag,
        budget_hot = config.kv.budget_hot,
        budget_warm = config.kv.budget_warm,
        "configuration loaded"
    );

    let coordinator = Coordinator::open(config, Arc::new(StubInferBackend::new())).await?;

    coordinator
        .load_model("demo-model", &vec![0.5f32; 256], 16, Domain::Code)
        .await?;
    let result = coordinator.generate("the quick brown fox", 32).await?;
    info!(text = %result.text, tokens = result.tokens_generated, "generation complete");

    let stats = coordinator.stats().await;
    Coordinator::print_cache_stats(&stats);

    Ok(())
}
