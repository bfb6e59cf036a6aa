use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mockbeat::engine::Engine;
use mockbeat::proxy::{serve, ShutdownSignal};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// A scriptable HTTP(S) mocking/mutation proxy.
#[derive(Debug, Parser)]
#[command(name = "mockbeat", version, about)]
struct Cli {
    /// Path to the JSON rule file.
    #[arg(long, default_value = "mock.json")]
    mock: PathBuf,

    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1:8888")]
    listen: SocketAddr,

    /// Upstream base URL unmocked traffic is forwarded to.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    upstream: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mockbeat=info".into());
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        "starting mockbeat v{} on {}, forwarding to {}",
        env!("CARGO_PKG_VERSION"),
        cli.listen,
        cli.upstream
    );

    let engine = Arc::new(Engine::new(cli.mock.clone()));
    engine
        .on_load()
        .await
        .with_context(|| format!("loading mock configuration from {}", cli.mock.display()))?;

    let shutdown = ShutdownSignal::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, shutting down");
        ctrl_c_shutdown.request();
    });

    serve(cli.listen, cli.upstream, engine, shutdown)
        .await
        .context("running mock proxy")?;

    Ok(())
}
