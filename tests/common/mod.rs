#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chapterflow::adapters::{
    AdapterError, GenerationContext, GenerationMode, Generator, ScrapedPage, Scraper,
};
use chapterflow::chapter_store::LocalFsChapterStore;
use chapterflow::config::WorkflowConfig;
use chapterflow::ledger::LocalFsReviewLedger;
use chapterflow::store::{HashingEmbedder, LocalFsContentStore};
use chapterflow::workflow::{Collaborators, WorkflowEngine};
use url::Url;

/// Returns a fixed article for every URL, or a scripted failure.
#[derive(Default)]
pub struct StaticScraper {
    calls: AtomicUsize,
    failure: Mutex<Option<AdapterError>>,
}

impl StaticScraper {
    pub fn failing(err: AdapterError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failure: Mutex::new(Some(err)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn article_for(url: &Url) -> String {
    format!(
        "The harbour gates opened at dawn. Fishing boats slid out past the lighthouse \
while the keeper logged the tide.\n\nSource page: {url}"
    )
}

#[async_trait]
impl Scraper for StaticScraper {
    async fn scrape(&self, url: &Url) -> Result<ScrapedPage, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let title = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("Untitled page")
            .to_owned();
        Ok(ScrapedPage {
            content: article_for(url),
            title,
            metadata: [("fetched_by".to_owned(), "static".to_owned())].into(),
            snapshot_ref: None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(AdapterError),
    Stall(Duration),
}

#[derive(Debug, Clone)]
pub struct Call {
    pub mode: GenerationMode,
    pub input: String,
    pub context: GenerationContext,
}

/// Generator whose replies are scripted per mode. Unscripted calls fall back
/// to deterministic defaults; a permanent failure overrides both.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<HashMap<GenerationMode, VecDeque<Step>>>,
    permanent: Mutex<HashMap<GenerationMode, AdapterError>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedGenerator {
    pub fn push(&self, mode: GenerationMode, step: Step) {
        self.script
            .lock()
            .unwrap()
            .entry(mode)
            .or_default()
            .push_back(step);
    }

    pub fn fail_always(&self, mode: GenerationMode, err: AdapterError) {
        self.permanent.lock().unwrap().insert(mode, err);
    }

    pub fn calls(&self, mode: GenerationMode) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.mode == mode)
            .cloned()
            .collect()
    }

    fn default_reply(mode: GenerationMode, input: &str, context: &GenerationContext) -> String {
        match mode {
            GenerationMode::Draft => format!(
                "# {}\n\n{input}",
                context.get(GenerationContext::TITLE).unwrap_or("Draft")
            ),
            GenerationMode::Spin => {
                let notes = context
                    .get(GenerationContext::INSTRUCTIONS)
                    .map(|notes| format!("\n\n(revised: {notes})"))
                    .unwrap_or_default();
                format!("{input}\n\nSpun with fresh language.{notes}")
            }
            GenerationMode::Review => {
                "Verdict: accept\nScore: 8\nSuggestions:\n- none\n".to_owned()
            }
            GenerationMode::Summarize => "harbour, tides, lighthouse".to_owned(),
        }
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> Result<String, AdapterError> {
        self.calls.lock().unwrap().push(Call {
            mode,
            input: input.to_owned(),
            context: context.clone(),
        });
        if let Some(err) = self.permanent.lock().unwrap().get(&mode).cloned() {
            return Err(err);
        }
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&mode)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(Self::default_reply(mode, input, context))
            }
            None => Ok(Self::default_reply(mode, input, context)),
        }
    }
}

pub struct Harness {
    pub temp: tempfile::TempDir,
    pub engine: Arc<WorkflowEngine>,
    pub scraper: Arc<StaticScraper>,
    pub generator: Arc<ScriptedGenerator>,
    pub store: Arc<LocalFsContentStore>,
    pub ledger: Arc<LocalFsReviewLedger>,
    pub chapters: Arc<LocalFsChapterStore>,
}

/// No backoff and a short adapter timeout.
pub fn fast_config() -> WorkflowConfig {
    WorkflowConfig {
        retry_backoff_ms: 0,
        adapter_timeout_ms: 2_000,
        ..WorkflowConfig::default()
    }
}

pub async fn harness(config: WorkflowConfig) -> anyhow::Result<Harness> {
    harness_with(config, StaticScraper::default(), ScriptedGenerator::default()).await
}

pub async fn harness_with(
    config: WorkflowConfig,
    scraper: StaticScraper,
    generator: ScriptedGenerator,
) -> anyhow::Result<Harness> {
    let temp = tempfile::TempDir::new()?;
    let store = Arc::new(
        LocalFsContentStore::open(temp.path(), Arc::new(HashingEmbedder::new(64))).await?,
    );
    let ledger = Arc::new(LocalFsReviewLedger::new(temp.path()));
    let chapters = Arc::new(LocalFsChapterStore::new(temp.path()));
    let scraper = Arc::new(scraper);
    let generator = Arc::new(generator);

    let engine = Arc::new(WorkflowEngine::new(
        Collaborators {
            store: store.clone(),
            ledger: ledger.clone(),
            chapters: chapters.clone(),
            scraper: scraper.clone(),
            generator: generator.clone(),
        },
        config,
    ));
    Ok(Harness {
        temp,
        engine,
        scraper,
        generator,
        store,
        ledger,
        chapters,
    })
}

/// Reopens the engine over the same data dir with fresh in-memory state.
pub async fn reopen(harness: &Harness, config: WorkflowConfig) -> anyhow::Result<WorkflowEngine> {
    let store =
        LocalFsContentStore::open(harness.temp.path(), Arc::new(HashingEmbedder::new(64))).await?;
    Ok(WorkflowEngine::new(
        Collaborators {
            store: Arc::new(store),
            ledger: Arc::new(LocalFsReviewLedger::new(harness.temp.path())),
            chapters: Arc::new(LocalFsChapterStore::new(harness.temp.path())),
            scraper: harness.scraper.clone(),
            generator: harness.generator.clone(),
        },
        config,
    ))
}
