use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use chapterflow::app::api::{AppState, router};
use chapterflow::cli::GlobalArgs;
use chapterflow::config::EngineKind;
use chapterflow::logging::LogFormat;
use chapterflow::runtime::{OpenOptions, open_engine};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// YAML config file.
    #[arg(long, env = "CHAPTERFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    /// Chapters processed at once by queued work.
    #[arg(long, default_value_t = 2)]
    max_concurrency: usize,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let args = AppArgs::parse();
    chapterflow::logging::init(args.log_format)?;
    tracing::info!(?args, "starting chapterflow-app");

    let config = chapterflow::commands::resolve_config(&GlobalArgs {
        config: args.config.clone(),
        data_dir: args.data_dir.clone(),
        engine: args.engine,
        log_format: args.log_format,
    })
    .context("load config")?;
    let engine = open_engine(&config, OpenOptions::default()).await?;
    let app = router(AppState::new(Arc::new(engine), args.max_concurrency));

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, data_dir = %config.data_dir.display(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
