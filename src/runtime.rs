//! Wires the local-filesystem stores and configured adapters into a
//! [`WorkflowEngine`].

use std::sync::Arc;

use anyhow::Context as _;

use crate::adapters::Generator;
use crate::adapters::command::CommandGenerator;
use crate::adapters::http_scraper::HttpScraper;
use crate::adapters::noop::NoopGenerator;
use crate::adapters::openai::OpenAiGenerator;
use crate::chapter_store::LocalFsChapterStore;
use crate::config::{AppConfig, EngineKind};
use crate::ledger::LocalFsReviewLedger;
use crate::store::{ContentStore, HashingEmbedder, LocalFsContentStore};
use crate::workflow::{Collaborators, WorkflowEngine};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Rebuild a similarity index built by another embedder instead of
    /// failing with `IncompatibleIndex`.
    pub rebuild_index: bool,
    /// Commands that never generate skip building the configured generator
    /// (and so never need its credentials).
    pub read_only: bool,
}

pub async fn open_engine(
    config: &AppConfig,
    options: OpenOptions,
) -> anyhow::Result<WorkflowEngine> {
    config.validate()?;
    let data_dir = &config.data_dir;
    tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("create data dir: {}", data_dir.display()))?;

    let store = open_store(config, options.rebuild_index).await?;
    let snapshots = config.scraper.snapshots.then(|| data_dir.join("snapshots"));
    let scraper = HttpScraper::new(&config.scraper, snapshots)?;
    let generator = if options.read_only {
        Arc::new(NoopGenerator) as Arc<dyn Generator>
    } else {
        build_generator(config)?
    };

    tracing::debug!(
        data_dir = %data_dir.display(),
        engine = generator.name(),
        "opened workflow engine"
    );
    Ok(WorkflowEngine::new(
        Collaborators {
            store,
            ledger: Arc::new(LocalFsReviewLedger::new(data_dir)),
            chapters: Arc::new(LocalFsChapterStore::new(data_dir)),
            scraper: Arc::new(scraper),
            generator,
        },
        config.workflow.clone(),
    ))
}

pub async fn open_store(
    config: &AppConfig,
    rebuild_index: bool,
) -> anyhow::Result<Arc<dyn ContentStore>> {
    let embedder = Arc::new(HashingEmbedder::new(config.index.dimensions));
    let store = if rebuild_index {
        LocalFsContentStore::open_with_rebuild(&config.data_dir, embedder).await?
    } else {
        LocalFsContentStore::open(&config.data_dir, embedder).await?
    };
    Ok(Arc::new(store))
}

pub fn build_generator(config: &AppConfig) -> anyhow::Result<Arc<dyn Generator>> {
    Ok(match config.engine {
        EngineKind::Noop => Arc::new(NoopGenerator),
        EngineKind::Openai => Arc::new(
            OpenAiGenerator::from_env(&config.openai).context("configure openai engine")?,
        ),
        EngineKind::Command => Arc::new(CommandGenerator::from_config(&config.command)?),
    })
}
