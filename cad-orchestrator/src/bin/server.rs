//! CadAgent Server binary

use anyhow::{Context, Result};
use cadagent::api::{create_router, ApiState};
use cadagent::{CadAgentConfig, CadPipeline};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Config file is optional; defaults + environment are enough to run
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = CadAgentConfig::load(config_path.as_deref()).with_context(|| {
        format!(
            "Failed to load config file: {}",
            config_path
                .as_deref()
                .map_or_else(|| "<none>".into(), |p| p.display().to_string())
        )
    })?;
    config.apply_env().context("Invalid environment override")?;

    // Initialize logging
    let level: Level = config
        .server
        .log_level
        .parse()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting CadAgent Server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = ?config_path,
        provider = config.llm.provider_type,
        model = config.llm.model,
        max_attempts = config.max_attempts,
        python = config.executor.python,
        executor_timeout_secs = config.executor.timeout_secs,
        "Loaded configuration"
    );

    let pipeline =
        CadPipeline::from_config(&config).context("Failed to configure the LLM provider")?;
    if !pipeline.llm_configured() {
        warn!("No LLM API key found (set ANTHROPIC_API_KEY); /api/generate will use the fallback generator");
    }

    let modules = pipeline.executor().runner().available_modules().await;
    if modules.iter().any(|m| m == "cadquery") {
        info!(modules = ?modules, "CAD modules available");
    } else {
        warn!(
            python = config.executor.python,
            "CadQuery not importable; exports will be synthetic previews"
        );
    }

    // Create API state
    let state = Arc::new(ApiState {
        pipeline: Arc::new(pipeline),
    });

    // Create router
    let app = create_router(state, &config.server.static_dir);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address: {}:{}",
                config.server.host, config.server.port
            )
        })?;
    info!(static_dir = %config.server.static_dir.display(), "Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
