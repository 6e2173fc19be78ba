use std::process::ExitCode;

use anyhow::Context as _;
use chapterflow::cli::{Cli, Command, HistoryCommand, PublicationCommand, ReviewCommand};
use chapterflow::commands;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    chapterflow::logging::init(cli.global.log_format).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    let config = commands::resolve_config(&cli.global).context("load config")?;

    match cli.command {
        Command::Process(args) => commands::process(&config, args).await.context("process")?,
        Command::Batch(args) => commands::batch(&config, args).await.context("batch")?,
        Command::Advance(args) => commands::advance(&config, args).await.context("advance")?,
        Command::Status(args) => commands::status(&config, args).await.context("status")?,
        Command::History {
            command: HistoryCommand::Show(args),
        } => commands::history_show(&config, args)
            .await
            .context("history show")?,
        Command::History {
            command: HistoryCommand::Export(args),
        } => commands::history_export(&config, args)
            .await
            .context("history export")?,
        Command::Reviews(args) => commands::reviews(&config, args).await.context("reviews")?,
        Command::Review {
            command: ReviewCommand::Approve(args),
        } => commands::approve(&config, args)
            .await
            .context("review approve")?,
        Command::Review {
            command: ReviewCommand::Reject(args),
        } => commands::reject(&config, args)
            .await
            .context("review reject")?,
        Command::Publication {
            command: PublicationCommand::View(args),
        } => commands::publication_view(&config, args)
            .await
            .context("publication view")?,
        Command::Publication {
            command: PublicationCommand::Export(args),
        } => commands::publication_export(&config, args)
            .await
            .context("publication export")?,
        Command::Search(args) => commands::search(&config, args).await.context("search")?,
        Command::Stats => commands::stats(&config).await.context("stats")?,
        Command::Reindex => commands::reindex(&config).await.context("reindex")?,
    }

    Ok(())
}
