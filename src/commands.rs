//! CLI command implementations. Each takes the resolved [`AppConfig`] and
//! prints its result to stdout.

use std::sync::Arc;

use anyhow::Context as _;

use crate::book::{self, ExportOptions};
use crate::cli::{
    AdvanceArgs, ApproveArgs, BatchArgs, GlobalArgs, HistoryExportArgs, HistoryShowArgs,
    ProcessArgs, PublicationExportArgs, PublicationViewArgs, RejectArgs, ReviewsArgs, SearchArgs,
    StatusArgs,
};
use crate::config::AppConfig;
use crate::model::{Chapter, Decision, ReviewPayload, ReviewRequest};
use crate::runtime::{OpenOptions, open_engine, open_store};
use crate::store::SearchOptions;
use crate::workflow::{Advance, WorkflowEngine};

/// Defaults, then the YAML file, then `CHAPTERFLOW_*`, then CLI flags.
pub fn resolve_config(global: &GlobalArgs) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(global.config.as_deref())?;
    if let Some(data_dir) = &global.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(engine) = global.engine {
        config.engine = engine;
    }
    config.validate()?;
    Ok(config)
}

async fn read_only(config: &AppConfig) -> anyhow::Result<WorkflowEngine> {
    open_engine(
        config,
        OpenOptions {
            read_only: true,
            ..OpenOptions::default()
        },
    )
    .await
}

pub async fn process(config: &AppConfig, args: ProcessArgs) -> anyhow::Result<()> {
    let engine = open_engine(config, OpenOptions::default()).await?;
    let chapter = if args.scrape_only {
        engine.ingest(&args.url).await?
    } else {
        engine.process(&args.url).await?
    };
    print_chapter(&chapter);
    Ok(())
}

pub async fn batch(config: &AppConfig, args: BatchArgs) -> anyhow::Result<()> {
    let mut urls = args.urls;
    if let Some(path) = &args.file {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read url list: {}", path.display()))?;
        urls.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned),
        );
    }
    anyhow::ensure!(!urls.is_empty(), "no urls given (use --url or --file)");

    let engine = Arc::new(open_engine(config, OpenOptions::default()).await?);
    let total = urls.len();
    let outcomes = engine.process_batch(urls, args.concurrency).await;

    let mut failed = 0;
    for outcome in outcomes {
        match outcome.result {
            Ok(chapter) => println!(
                "ok\t{}\t{}\t{}",
                outcome.url,
                chapter.id,
                chapter.state()
            ),
            Err(err) => {
                failed += 1;
                println!("failed\t{}\t{err}", outcome.url);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {total} url(s) failed");
    }
    Ok(())
}

pub async fn advance(config: &AppConfig, args: AdvanceArgs) -> anyhow::Result<()> {
    let engine = open_engine(config, OpenOptions::default()).await?;
    if args.until_suspended {
        let chapter = engine.run_until_suspended(&args.chapter).await?;
        print_chapter(&chapter);
        return Ok(());
    }
    match engine.advance(&args.chapter).await? {
        Advance::Version(version) => {
            println!("stored {} ({}, {})", version.id, version.phase, version.agent);
        }
        Advance::AwaitingReview(request) => {
            println!("awaiting review: request {} on {}", request.id, request.version_id);
        }
    }
    Ok(())
}

pub async fn status(config: &AppConfig, args: StatusArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let Some(chapter_id) = args.chapter else {
        let chapters = engine.list_chapters().await?;
        if args.json {
            return print_json(&chapters);
        }
        for chapter in &chapters {
            println!(
                "{}\t{}\t{} version(s)\t{}",
                chapter.id,
                chapter.state(),
                chapter.versions.len(),
                chapter.title
            );
        }
        return Ok(());
    };

    let report = engine.chapter_report(&chapter_id).await?;
    if args.json {
        return print_json(&report);
    }
    print_chapter(&report.chapter);
    println!("rejections: {}", report.chapter.rejections);
    if !report.chapter.themes.is_empty() {
        println!("themes: {}", report.chapter.themes.join(", "));
    }
    if let Some(err) = &report.chapter.last_error {
        println!("last error: {err}");
    }
    for version in &report.versions {
        println!(
            "  {}\t{}\t{}\t{} chars",
            version.id, version.phase, version.agent, version.chars
        );
    }
    for request in &report.reviews {
        print_review(request);
    }
    Ok(())
}

pub async fn history_show(config: &AppConfig, args: HistoryShowArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    for version in engine.history(&args.chapter).await? {
        println!(
            "{}\t{}\t{}\t{}",
            version.id,
            version.phase,
            version.agent,
            version.created_at.to_rfc3339()
        );
        if args.full {
            println!("{}\n", version.content.trim_end());
        }
    }
    Ok(())
}

pub async fn history_export(config: &AppConfig, args: HistoryExportArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let versions = engine.history(&args.chapter).await?;
    let out = args.out;
    let count = versions.len();
    let written = out.clone();
    tokio::task::spawn_blocking(move || book::write_history_jsonl(&out, &versions))
        .await
        .context("join history export")??;
    println!("wrote {count} version(s) to {}", written.display());
    Ok(())
}

pub async fn reviews(config: &AppConfig, args: ReviewsArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let pending = engine.pending_reviews().await?;
    if args.json {
        return print_json(&pending);
    }
    for request in &pending {
        print_review(request);
    }
    Ok(())
}

pub async fn approve(config: &AppConfig, args: ApproveArgs) -> anyhow::Result<()> {
    let edited_content = match &args.edited_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read edited content: {}", path.display()))?,
        ),
        None => None,
    };
    let payload = ReviewPayload {
        edited_content,
        feedback: args.feedback,
        reviewer: args.reviewer,
    };
    let engine = read_only(config).await?;
    let chapter = engine
        .submit_human_decision(&args.request, Decision::Approve, payload)
        .await?;
    print_chapter(&chapter);
    Ok(())
}

pub async fn reject(config: &AppConfig, args: RejectArgs) -> anyhow::Result<()> {
    let payload = ReviewPayload {
        edited_content: None,
        feedback: args.feedback,
        reviewer: args.reviewer,
    };
    let decision = Decision::Reject {
        reenter_at: args.reenter_at,
    };
    let engine = read_only(config).await?;
    let chapter = engine
        .submit_human_decision(&args.request, decision, payload)
        .await?;
    print_chapter(&chapter);
    if let Some(phase) = chapter.reentry {
        println!("re-enters at {phase}; run `advance --until-suspended --chapter {}`", chapter.id);
    }
    Ok(())
}

pub async fn publication_view(config: &AppConfig, args: PublicationViewArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let book = engine.get_book().await?;
    if args.json {
        return print_json(&book);
    }
    print!("{}", book.render_markdown());
    Ok(())
}

pub async fn publication_export(
    config: &AppConfig,
    args: PublicationExportArgs,
) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let summary = engine
        .export_publication(ExportOptions {
            out_dir: args.out,
            zip: args.zip,
            force: args.force,
        })
        .await?;
    for file in &summary.files {
        println!("{}", file.display());
    }
    if let Some(zip_path) = &summary.zip_path {
        println!("{}", zip_path.display());
    }
    Ok(())
}

pub async fn search(config: &AppConfig, args: SearchArgs) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    let default_min = (config.index.min_score > 0.0).then_some(config.index.min_score);
    let options = SearchOptions {
        k: args.k,
        chapter_id: args.chapter,
        phase: args.phase,
        min_score: args.min_score.or(default_min),
    };
    let hits = engine.search(&args.query, &options).await?;
    if args.json {
        return print_json(&hits);
    }
    for hit in &hits {
        let preview = hit
            .version
            .content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default();
        println!(
            "{:.4}\t{}\t{}\t{}",
            hit.score,
            hit.version.id,
            hit.version.phase,
            truncate_chars(preview, 80)
        );
    }
    Ok(())
}

pub async fn stats(config: &AppConfig) -> anyhow::Result<()> {
    let engine = read_only(config).await?;
    print_json(&engine.statistics().await?)
}

pub async fn reindex(config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config, true).await?;
    let count = store.rebuild_index().await?;
    println!("indexed {count} version(s)");
    Ok(())
}

fn print_chapter(chapter: &Chapter) {
    println!("chapter {}\t{}\t{}", chapter.id, chapter.state(), chapter.title);
    if let Some(request_id) = &chapter.open_review {
        println!("review request: {request_id}");
    }
}

fn print_review(request: &ReviewRequest) {
    println!(
        "review {}\t{}\t{:?}\t{}\topened {}",
        request.id,
        request.chapter_id,
        request.status,
        request.version_id,
        request.opened_at.to_rfc3339()
    );
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_owned(),
    }
}
