use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::EngineKind;
use crate::logging::LogFormat;
use crate::model::Phase;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// YAML config file (defaults apply when omitted).
    #[arg(long, global = true, env = "CHAPTERFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory (overrides config and environment).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Generation engine (overrides config and environment).
    #[arg(long, global = true, value_enum)]
    pub engine: Option<EngineKind>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scrape a URL into a new chapter and run it up to human review.
    Process(ProcessArgs),
    /// Process many URLs concurrently.
    Batch(BatchArgs),
    /// Run the next transition of one chapter.
    Advance(AdvanceArgs),
    /// Show all chapters, or one chapter in detail.
    Status(StatusArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    /// List pending review requests.
    Reviews(ReviewsArgs),
    Review {
        #[command(subcommand)]
        command: ReviewCommand,
    },
    Publication {
        #[command(subcommand)]
        command: PublicationCommand,
    },
    /// Similarity search over stored versions.
    Search(SearchArgs),
    /// Store and workflow counters.
    Stats,
    /// Re-embed every stored version with the configured embedder.
    Reindex,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Page to scrape (http, https or file URL).
    #[arg(long)]
    pub url: String,

    /// Stop after the RAW version is stored.
    #[arg(long)]
    pub scrape_only: bool,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// URL to process; repeatable.
    #[arg(long = "url")]
    pub urls: Vec<String>,

    /// File with one URL per line (`#` starts a comment).
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Maximum chapters processed at once.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,
}

#[derive(Debug, Args)]
pub struct AdvanceArgs {
    #[arg(long)]
    pub chapter: String,

    /// Keep advancing until the chapter awaits review or is terminal.
    #[arg(long)]
    pub until_suspended: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Chapter to describe (default: list every chapter).
    #[arg(long)]
    pub chapter: Option<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Print a chapter's versions in sequence order.
    Show(HistoryShowArgs),
    /// Write a chapter's versions as JSON lines.
    Export(HistoryExportArgs),
}

#[derive(Debug, Args)]
pub struct HistoryShowArgs {
    #[arg(long)]
    pub chapter: String,

    /// Print each version's content too.
    #[arg(long)]
    pub full: bool,
}

#[derive(Debug, Args)]
pub struct HistoryExportArgs {
    #[arg(long)]
    pub chapter: String,

    /// Output path for the `.jsonl` file.
    #[arg(long)]
    pub out: PathBuf,
}

#[derive(Debug, Args)]
pub struct ReviewsArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ReviewCommand {
    Approve(ApproveArgs),
    Reject(RejectArgs),
}

#[derive(Debug, Args)]
pub struct ApproveArgs {
    /// Review request id.
    #[arg(long)]
    pub request: String,

    /// File holding edited content to publish instead of the reviewed text.
    #[arg(long)]
    pub edited_file: Option<PathBuf>,

    #[arg(long)]
    pub feedback: Option<String>,

    #[arg(long)]
    pub reviewer: Option<String>,
}

#[derive(Debug, Args)]
pub struct RejectArgs {
    /// Review request id.
    #[arg(long)]
    pub request: String,

    /// Passed to the generator as revision notes.
    #[arg(long)]
    pub feedback: Option<String>,

    /// Phase to re-run (DRAFTED or SPUN; default from the re-entry policy).
    #[arg(long)]
    pub reenter_at: Option<Phase>,

    #[arg(long)]
    pub reviewer: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PublicationCommand {
    /// Print the publication as Markdown.
    View(PublicationViewArgs),
    /// Write book.md, book.json and per-chapter histories.
    Export(PublicationExportArgs),
}

#[derive(Debug, Args)]
pub struct PublicationViewArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct PublicationExportArgs {
    /// Output directory.
    #[arg(long)]
    pub out: PathBuf,

    /// Also write `publication.zip`.
    #[arg(long)]
    pub zip: bool,

    /// Overwrite an existing export.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long)]
    pub query: String,

    #[arg(long, default_value_t = 5)]
    pub k: usize,

    #[arg(long)]
    pub chapter: Option<String>,

    #[arg(long)]
    pub phase: Option<Phase>,

    /// Drop hits scoring below this (default from config).
    #[arg(long)]
    pub min_score: Option<f32>,

    #[arg(long)]
    pub json: bool,
}
