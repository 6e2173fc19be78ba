use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use url::Url;

use super::policy;
use crate::adapters::critique::{self, Critique, Verdict};
use crate::adapters::{
    AdapterError, GenerationContext, GenerationMode, Generator, ScrapedPage, Scraper, non_empty,
};
use crate::book::{self, Book, BookChapter, ExportOptions, ExportSummary};
use crate::chapter_store::ChapterStore;
use crate::config::WorkflowConfig;
use crate::error::{Result, RetryScope, WorkflowError};
use crate::ledger::{ReviewLedger, ReviewStatistics};
use crate::locks::{KeyGuard, KeyedLocks};
use crate::model::{
    AgentKind, Chapter, ChapterStatus, ChapterVersion, Decision, NewVersion, Phase,
    ReviewPayload, ReviewRequest, VersionId,
};
use crate::store::{ContentStore, SearchHit, SearchOptions, StoreStatistics};

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ContentStore>,
    pub ledger: Arc<dyn ReviewLedger>,
    pub chapters: Arc<dyn ChapterStore>,
    pub scraper: Arc<dyn Scraper>,
    pub generator: Arc<dyn Generator>,
}

/// Drives chapters through the phase state machine.
///
/// All transitions of one chapter are serialized by a per-chapter try-lock;
/// a second caller gets `InvalidState` instead of waiting. Different
/// chapters never contend.
pub struct WorkflowEngine {
    store: Arc<dyn ContentStore>,
    ledger: Arc<dyn ReviewLedger>,
    chapters: Arc<dyn ChapterStore>,
    scraper: Arc<dyn Scraper>,
    generator: Arc<dyn Generator>,
    config: WorkflowConfig,
    locks: KeyedLocks,
}

/// Outcome of one [`WorkflowEngine::advance`].
#[derive(Debug, Clone)]
pub enum Advance {
    /// A new version was stored.
    Version(ChapterVersion),
    /// The chapter is now waiting on a human.
    AwaitingReview(ReviewRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub phase: Phase,
    pub agent: AgentKind,
    pub created_at: DateTime<Utc>,
    pub chars: usize,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<VersionId>,
}

impl From<&ChapterVersion> for VersionSummary {
    fn from(version: &ChapterVersion) -> Self {
        Self {
            id: version.id.clone(),
            phase: version.phase,
            agent: version.agent,
            created_at: version.created_at,
            chars: version.content.chars().count(),
            content_hash: version.content_hash.clone(),
            parent: version.parent.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterReport {
    pub state: Phase,
    pub chapter: Chapter,
    pub versions: Vec<VersionSummary>,
    pub reviews: Vec<ReviewRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatistics {
    pub chapters_by_state: BTreeMap<Phase, usize>,
    pub reviews: ReviewStatistics,
    pub store: StoreStatistics,
}

struct Produced {
    content: String,
    critique: Option<Critique>,
}

impl WorkflowEngine {
    pub fn new(collaborators: Collaborators, config: WorkflowConfig) -> Self {
        Self {
            store: collaborators.store,
            ledger: collaborators.ledger,
            chapters: collaborators.chapters,
            scraper: collaborators.scraper,
            generator: collaborators.generator,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Scrapes `url` into a new chapter and runs it until it needs a human
    /// (or finalizes, when human review is off).
    pub async fn process(&self, url: &str) -> Result<Chapter> {
        let chapter = self.ingest(url).await?;
        self.run_until_suspended(&chapter.id).await
    }

    /// Scrapes `url` and stores the page as the `RAW` version of a new
    /// chapter. No chapter exists if scraping fails.
    pub async fn ingest(&self, url: &str) -> Result<Chapter> {
        let parsed = Url::parse(url.trim()).map_err(|err| WorkflowError::AdapterFailed {
            phase: Phase::Raw,
            message: format!("invalid url {url}: {err}"),
        })?;
        let page = self.scrape_with_retries(&parsed).await?;

        let chapter_id = new_chapter_id();
        let mut raw = NewVersion::new(Phase::Raw, AgentKind::Scraper, page.content)
            .with_meta("source_url", parsed.as_str())
            .with_meta("title", page.title.as_str());
        if let Some(snapshot_ref) = &page.snapshot_ref {
            raw = raw.with_meta("snapshot_ref", snapshot_ref.as_str());
        }
        for (key, value) in page.metadata {
            raw.metadata.entry(key).or_insert(value.into());
        }

        let version = self.store.put_version(&chapter_id, raw).await?;
        let chapter = Chapter::from_raw(&version, page.title, parsed.as_str());
        self.chapters.create(&chapter).await?;

        tracing::info!(
            chapter_id = %chapter.id,
            version_id = %version.id,
            url = %parsed,
            "ingested chapter"
        );
        Ok(chapter)
    }

    /// Runs one transition (with local retries).
    pub async fn advance(&self, chapter_id: &str) -> Result<Advance> {
        let _guard = self.try_lock(chapter_id, "advance")?;
        let mut chapter = self.load_reconciled(chapter_id).await?;
        self.advance_locked(&mut chapter).await
    }

    /// Advances until the chapter is waiting on a human or terminal.
    pub async fn run_until_suspended(&self, chapter_id: &str) -> Result<Chapter> {
        let _guard = self.try_lock(chapter_id, "run")?;
        let mut chapter = self.load_reconciled(chapter_id).await?;
        let budget = self.step_budget();
        for _ in 0..budget {
            if is_suspended(&chapter) {
                return Ok(chapter);
            }
            self.advance_locked(&mut chapter).await?;
        }
        if is_suspended(&chapter) {
            return Ok(chapter);
        }
        Err(WorkflowError::invalid_state(
            chapter_id,
            "run",
            format!("still {} after {budget} transitions", chapter.state()),
        ))
    }

    /// Most transitions one run can need: draft, spin and review, two more
    /// per automated revision, then the review request, plus one spare.
    fn step_budget(&self) -> usize {
        5 + 2 * self.config.max_ai_revisions as usize
    }

    pub async fn submit_human_decision(
        &self,
        request_id: &str,
        decision: Decision,
        payload: ReviewPayload,
    ) -> Result<Chapter> {
        let request = self.ledger.get(request_id).await?;
        let _guard = self.try_lock(&request.chapter_id, "review")?;

        let request = self.ledger.get(request_id).await?;
        if !request.is_open() {
            return Err(WorkflowError::AlreadyResolved {
                request_id: request_id.to_owned(),
            });
        }

        let mut chapter = self.load_reconciled(&request.chapter_id).await?;
        if chapter.state() != Phase::HumanReviewPending
            || chapter.open_review.as_deref() != Some(request_id)
        {
            return Err(WorkflowError::invalid_state(
                &chapter.id,
                "review",
                format!("chapter is {} and not awaiting request {request_id}", chapter.state()),
            ));
        }
        let resolved = self.ledger.resolve(request_id, decision, payload).await?;
        self.apply_decision(&mut chapter, &resolved).await?;
        Ok(chapter)
    }

    pub async fn chapter(&self, chapter_id: &str) -> Result<Chapter> {
        self.chapters
            .get(chapter_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("chapter", chapter_id))
    }

    /// Chapters ordered by creation time.
    pub async fn list_chapters(&self) -> Result<Vec<Chapter>> {
        Ok(self.chapters.list().await?)
    }

    pub async fn history(&self, chapter_id: &str) -> Result<Vec<ChapterVersion>> {
        let history = self.store.get_history(chapter_id).await?;
        if history.is_empty() {
            return Err(WorkflowError::not_found("chapter", chapter_id));
        }
        Ok(history)
    }

    pub async fn chapter_report(&self, chapter_id: &str) -> Result<ChapterReport> {
        let chapter = self.chapter(chapter_id).await?;
        let versions = self
            .store
            .get_history(chapter_id)
            .await?
            .iter()
            .map(VersionSummary::from)
            .collect();
        let reviews = self.ledger.list_for_chapter(chapter_id).await?;
        Ok(ChapterReport {
            state: chapter.state(),
            chapter,
            versions,
            reviews,
        })
    }

    pub async fn pending_reviews(&self) -> Result<Vec<ReviewRequest>> {
        self.ledger.list_pending().await
    }

    pub async fn review(&self, request_id: &str) -> Result<ReviewRequest> {
        self.ledger.get(request_id).await
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        self.store.search_with(query, options).await
    }

    pub async fn rebuild_index(&self) -> Result<usize> {
        self.store.rebuild_index().await
    }

    pub async fn statistics(&self) -> Result<WorkflowStatistics> {
        let mut chapters_by_state = BTreeMap::new();
        for chapter in self.chapters.list().await? {
            *chapters_by_state.entry(chapter.state()).or_default() += 1;
        }
        Ok(WorkflowStatistics {
            chapters_by_state,
            reviews: ReviewStatistics::from_requests(&self.ledger.list_all().await?),
            store: self.store.statistics().await?,
        })
    }

    /// Finalized chapters in creation order.
    pub async fn get_book(&self) -> Result<Book> {
        let mut chapters = Vec::new();
        for chapter in self.chapters.list().await? {
            if chapter.status != ChapterStatus::Finalized {
                continue;
            }
            let Some(final_ref) = chapter.latest_in_phase(Phase::Finalized) else {
                tracing::warn!(
                    chapter_id = %chapter.id,
                    "finalized chapter has no FINALIZED version"
                );
                continue;
            };
            let version = self.store.get_version(&final_ref.id).await?;
            chapters.push(BookChapter {
                id: chapter.id.clone(),
                title: chapter.title.clone(),
                source_url: chapter.source_url.clone(),
                version_id: version.id,
                content: version.content,
                finalized_at: chapter.finalized_at,
                themes: chapter.themes.clone(),
            });
        }
        Ok(Book {
            title: self.config.book_title.clone(),
            generated_at: Utc::now(),
            chapters,
        })
    }

    /// Writes the publication plus each published chapter's full history.
    pub async fn export_publication(&self, options: ExportOptions) -> Result<ExportSummary> {
        let book = self.get_book().await?;
        let mut histories = BTreeMap::new();
        for chapter in &book.chapters {
            histories.insert(chapter.id.clone(), self.store.get_history(&chapter.id).await?);
        }

        let summary = tokio::task::spawn_blocking(move || book::export(&book, &histories, &options))
            .await
            .map_err(|err| anyhow::anyhow!("join export task: {err}"))??;
        tracing::info!(
            out_dir = %summary.out_dir.display(),
            files = summary.files.len(),
            "exported publication"
        );
        Ok(summary)
    }

    async fn advance_locked(&self, chapter: &mut Chapter) -> Result<Advance> {
        let state = chapter.state();
        match state {
            Phase::Finalized | Phase::Abandoned => {
                return Err(WorkflowError::invalid_state(
                    &chapter.id,
                    "advance",
                    format!("chapter is {state}"),
                ));
            }
            Phase::HumanReviewPending => {
                return Err(WorkflowError::invalid_state(
                    &chapter.id,
                    "advance",
                    "chapter is awaiting human review",
                ));
            }
            _ => {}
        }

        match policy::next_target(chapter.current_phase, chapter.reentry) {
            Some(target) => self.produce(chapter, target).await.map(Advance::Version),
            None => self.request_review(chapter).await,
        }
    }

    async fn produce(&self, chapter: &mut Chapter, target: Phase) -> Result<ChapterVersion> {
        let (Some(mode), Some(input_phase)) = (target.generation_mode(), target.input_phase())
        else {
            return Err(WorkflowError::invalid_state(
                &chapter.id,
                "advance",
                format!("{target} is not produced by a generator"),
            ));
        };
        let input_ref = chapter.latest_in_phase(input_phase).cloned().ok_or_else(|| {
            WorkflowError::invalid_state(
                &chapter.id,
                "advance",
                format!("no {input_phase} version to produce {target} from"),
            )
        })?;
        let input = self.store.get_version(&input_ref.id).await?;
        let context = self.context_for(chapter, mode).await?;

        let max_attempts = self.config.max_attempts;
        let produced = loop {
            let attempt = chapter.attempts(target) + 1;
            tracing::info!(
                chapter_id = %chapter.id,
                phase = %target,
                attempt,
                max_attempts,
                generator = self.generator.name(),
                "producing phase"
            );

            let err = match self.attempt(mode, &input.content, &context).await {
                Ok(produced) => break produced,
                Err(err) => err,
            };

            let failure = WorkflowError::from_adapter(target, &err, self.config.adapter_timeout_ms);
            chapter.phase_attempts.insert(target, attempt);
            chapter.last_error = Some(failure.to_string());
            chapter.updated_at = Utc::now();

            if attempt >= max_attempts {
                let exhausted = WorkflowError::RetryLimitExceeded {
                    subject: chapter.id.clone(),
                    scope: RetryScope::Phase(target),
                    attempts: attempt,
                    last_error: failure.to_string(),
                };
                self.abandon(chapter, &exhausted).await?;
                return Err(exhausted);
            }
            self.chapters.put(chapter).await?;

            if !err.is_retryable() {
                tracing::warn!(
                    chapter_id = %chapter.id,
                    phase = %target,
                    attempt,
                    %failure,
                    "adapter failed"
                );
                return Err(failure);
            }
            tracing::warn!(
                chapter_id = %chapter.id,
                phase = %target,
                attempt,
                %failure,
                "retrying"
            );
            self.backoff().await;
        };

        let attempts = chapter.attempts(target) + 1;
        chapter.phase_attempts.remove(&target);
        chapter.last_error = None;

        let mut new = NewVersion::new(target, target.producing_agent(), produced.content)
            .with_parent(&input.id)
            .with_meta("generator", self.generator.name())
            .with_meta("mode", mode.as_str())
            .with_meta("attempts", attempts);
        if let Some(notes) = context.get(GenerationContext::INSTRUCTIONS) {
            new = new.with_meta("revision_notes", notes);
        }
        if let Some(critique) = &produced.critique {
            new = new
                .with_meta("verdict", critique.verdict.as_str())
                .with_meta("suggestions", critique.suggestions.clone())
                .with_meta("revised", critique.revised_content.is_some());
            if let Some(score) = critique.score {
                new = new.with_meta("score", score);
            }
        }
        if target == Phase::Drafted {
            let themes = self.summarize_themes(chapter, &new.content).await;
            if !themes.is_empty() {
                new = new.with_meta("themes", themes.clone());
                chapter.themes = themes;
            }
        }

        let version = self.store.put_version(&chapter.id, new).await?;
        chapter.record_version(&version);
        if chapter.reentry == Some(target) {
            chapter.reentry = None;
        }
        if target == Phase::AiReviewed {
            chapter.revision_notes = None;
            if let Some(critique) = &produced.critique
                && critique.verdict == Verdict::Revise
            {
                self.schedule_ai_revision(chapter, critique);
            }
        }
        self.chapters.put(chapter).await?;

        tracing::info!(
            chapter_id = %chapter.id,
            version_id = %version.id,
            phase = %target,
            "stored version"
        );
        Ok(version)
    }

    fn schedule_ai_revision(&self, chapter: &mut Chapter, critique: &Critique) {
        if chapter.ai_revisions >= self.config.max_ai_revisions {
            tracing::info!(
                chapter_id = %chapter.id,
                ai_revisions = chapter.ai_revisions,
                "automated revision budget spent; advancing to human review"
            );
            return;
        }
        chapter.ai_revisions += 1;
        chapter.reentry = Some(Phase::Spun);
        chapter.revision_notes = Some(
            critique
                .revision_notes()
                .unwrap_or_else(|| "Address the automated reviewer's concerns.".to_owned()),
        );
        tracing::info!(
            chapter_id = %chapter.id,
            ai_revisions = chapter.ai_revisions,
            "automated reviewer asked for a revision; re-spinning"
        );
    }

    async fn attempt(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> std::result::Result<Produced, AdapterError> {
        let output = self
            .call_adapter(self.generator.generate(mode, input, context))
            .await?;
        let output = non_empty(output)?;
        match mode {
            GenerationMode::Review => {
                let critique = critique::parse(&output)?;
                Ok(Produced {
                    content: critique
                        .revised_content
                        .clone()
                        .unwrap_or_else(|| input.to_owned()),
                    critique: Some(critique),
                })
            }
            _ => Ok(Produced {
                content: output.trim().to_owned(),
                critique: None,
            }),
        }
    }

    async fn context_for(
        &self,
        chapter: &Chapter,
        mode: GenerationMode,
    ) -> Result<GenerationContext> {
        let mut context = GenerationContext::new()
            .with(GenerationContext::TITLE, &chapter.title)
            .with(GenerationContext::SOURCE_URL, &chapter.source_url);
        if !chapter.themes.is_empty() {
            context.insert(GenerationContext::THEMES, chapter.themes.join(", "));
        }
        match mode {
            GenerationMode::Draft | GenerationMode::Spin => {
                if let Some(notes) = &chapter.revision_notes {
                    context.insert(GenerationContext::INSTRUCTIONS, notes);
                }
            }
            GenerationMode::Review => {
                if let Some(raw) = chapter.latest_in_phase(Phase::Raw) {
                    let raw = self.store.get_version(&raw.id).await?;
                    context.insert(GenerationContext::ORIGINAL, raw.content);
                }
            }
            GenerationMode::Summarize => {}
        }
        Ok(context)
    }

    /// Best effort: failures are logged and yield no themes.
    async fn summarize_themes(&self, chapter: &Chapter, draft: &str) -> Vec<String> {
        let context = GenerationContext::new().with(GenerationContext::TITLE, &chapter.title);
        let summary = self
            .call_adapter(self.generator.generate(GenerationMode::Summarize, draft, &context))
            .await;
        match summary {
            Ok(summary) => policy::parse_themes(&summary),
            Err(err) => {
                tracing::warn!(chapter_id = %chapter.id, %err, "theme summary failed; continuing");
                Vec::new()
            }
        }
    }

    async fn request_review(&self, chapter: &mut Chapter) -> Result<Advance> {
        let latest = chapter
            .latest_version()
            .filter(|v| v.phase == Phase::AiReviewed)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::invalid_state(
                    &chapter.id,
                    "advance",
                    format!("chapter is {}, not AI_REVIEWED", chapter.current_phase),
                )
            })?;

        if !self.config.require_human_review {
            let reviewed = self.store.get_version(&latest.id).await?;
            let new = NewVersion::new(Phase::Finalized, AgentKind::System, reviewed.content)
                .with_parent(&reviewed.id)
                .with_meta("auto_finalized", true);
            return self.finalize(chapter, new).await.map(Advance::Version);
        }

        let request = match self.ledger.open_request(&latest.id).await {
            Ok(request) => request,
            Err(WorkflowError::DuplicateOpenRequest { .. }) => self
                .ledger
                .find_open(&latest.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("open review request for {} vanished", latest.id))?,
            Err(err) => return Err(err),
        };

        chapter.open_review = Some(request.id.clone());
        chapter.updated_at = Utc::now();
        self.chapters.put(chapter).await?;
        tracing::info!(
            chapter_id = %chapter.id,
            request_id = %request.id,
            version_id = %latest.id,
            "awaiting human review"
        );
        Ok(Advance::AwaitingReview(request))
    }

    async fn finalize(&self, chapter: &mut Chapter, new: NewVersion) -> Result<ChapterVersion> {
        let version = self.store.put_version(&chapter.id, new).await?;
        chapter.record_version(&version);
        chapter.status = ChapterStatus::Finalized;
        chapter.finalized_at = Some(version.created_at);
        chapter.open_review = None;
        chapter.reentry = None;
        chapter.revision_notes = None;
        chapter.last_error = None;
        self.chapters.put(chapter).await?;
        tracing::info!(chapter_id = %chapter.id, version_id = %version.id, "chapter finalized");
        Ok(version)
    }

    async fn apply_decision(&self, chapter: &mut Chapter, request: &ReviewRequest) -> Result<()> {
        let Some(decision) = request.decision else {
            return Err(WorkflowError::invalid_state(
                &chapter.id,
                "apply review to",
                format!("request {} has no decision", request.id),
            ));
        };

        match decision {
            Decision::Approve => {
                if chapter.current_phase == Phase::Finalized {
                    chapter.status = ChapterStatus::Finalized;
                    chapter.open_review = None;
                    self.chapters.put(chapter).await?;
                    return Ok(());
                }
                let reviewed = self.store.get_version(&request.version_id).await?;
                let edited = request.payload.edited();
                let content = edited
                    .map(str::to_owned)
                    .unwrap_or_else(|| reviewed.content.clone());
                let mut new = NewVersion::new(Phase::Finalized, AgentKind::Human, content)
                    .with_parent(&reviewed.id)
                    .with_meta("review_request", request.id.as_str())
                    .with_meta("edited", edited.is_some());
                if let Some(reviewer) = &request.payload.reviewer {
                    new = new.with_meta("reviewer", reviewer.as_str());
                }
                if let Some(feedback) = request.payload.feedback() {
                    new = new.with_meta("feedback", feedback);
                }
                self.finalize(chapter, new).await?;
            }
            Decision::Reject { reenter_at } => {
                chapter.open_review = None;
                chapter.rejections += 1;
                chapter.updated_at = Utc::now();
                let feedback = request.payload.feedback();

                if chapter.rejections >= self.config.max_rejections {
                    let exhausted = WorkflowError::RetryLimitExceeded {
                        subject: chapter.id.clone(),
                        scope: RetryScope::Rejections,
                        attempts: chapter.rejections,
                        last_error: feedback.unwrap_or("rejected without feedback").to_owned(),
                    };
                    return self.abandon(chapter, &exhausted).await;
                }

                let phase = policy::reentry_phase(reenter_at, feedback, &self.config.reentry);
                chapter.reentry = Some(phase);
                chapter.revision_notes = feedback.map(str::to_owned);
                self.chapters.put(chapter).await?;
                tracing::info!(
                    chapter_id = %chapter.id,
                    rejections = chapter.rejections,
                    reenter_at = %phase,
                    "chapter rejected"
                );
            }
        }
        Ok(())
    }

    async fn abandon(&self, chapter: &mut Chapter, reason: &WorkflowError) -> Result<()> {
        chapter.status = ChapterStatus::Abandoned;
        chapter.open_review = None;
        chapter.reentry = None;
        chapter.last_error = Some(reason.to_string());
        chapter.updated_at = Utc::now();
        self.chapters.put(chapter).await?;
        tracing::warn!(chapter_id = %chapter.id, %reason, "chapter abandoned");
        Ok(())
    }

    /// Loads the aggregate and repairs what a crash may have left behind:
    /// versions stored but never recorded, and review decisions recorded but
    /// never applied.
    async fn load_reconciled(&self, chapter_id: &str) -> Result<Chapter> {
        let (mut chapter, mut changed) = match self.chapters.get(chapter_id).await? {
            Some(chapter) => (chapter, false),
            None => (self.recover_chapter(chapter_id).await?, true),
        };

        let known: HashSet<VersionId> = chapter.versions.iter().map(|v| v.id.clone()).collect();
        for version in self.store.get_history(chapter_id).await? {
            if known.contains(&version.id) {
                continue;
            }
            tracing::warn!(
                chapter_id,
                version_id = %version.id,
                phase = %version.phase,
                "adopting version missing from chapter record"
            );
            chapter.record_version(&version);
            chapter.phase_attempts.remove(&version.phase);
            if chapter.reentry == Some(version.phase) {
                chapter.reentry = None;
            }
            if version.phase == Phase::Finalized {
                chapter.status = ChapterStatus::Finalized;
                chapter.finalized_at = Some(version.created_at);
                chapter.open_review = None;
            }
            changed = true;
        }

        if let Some(request_id) = chapter.open_review.clone() {
            let request = self.ledger.get(&request_id).await?;
            if !request.is_open() {
                tracing::warn!(chapter_id, %request_id, "applying review decision left unapplied");
                self.apply_decision(&mut chapter, &request).await?;
                changed = false;
            }
        }

        if changed {
            self.chapters.put(&chapter).await?;
        }
        Ok(chapter)
    }

    /// Rebuilds a chapter record from its stored `RAW` version.
    async fn recover_chapter(&self, chapter_id: &str) -> Result<Chapter> {
        let history = self.store.get_history(chapter_id).await?;
        let raw = history
            .first()
            .filter(|v| v.phase == Phase::Raw)
            .ok_or_else(|| WorkflowError::not_found("chapter", chapter_id))?;
        let meta = |key: &str| raw.metadata.get(key).and_then(|v| v.as_str()).unwrap_or("");
        let title = match meta("title") {
            "" => chapter_id.to_owned(),
            title => title.to_owned(),
        };
        tracing::warn!(chapter_id, "recovering chapter record from stored versions");
        Ok(Chapter::from_raw(raw, title, meta("source_url")))
    }

    fn try_lock(&self, chapter_id: &str, operation: &'static str) -> Result<KeyGuard> {
        self.locks.try_lock(chapter_id).ok_or_else(|| {
            WorkflowError::invalid_state(chapter_id, operation, "another transition is in progress")
        })
    }

    async fn scrape_with_retries(&self, url: &Url) -> Result<ScrapedPage> {
        let max_attempts = self.config.max_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.call_adapter(self.scraper.scrape(url)).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            let failure =
                WorkflowError::from_adapter(Phase::Raw, &err, self.config.adapter_timeout_ms);
            tracing::warn!(%url, attempt, max_attempts, %failure, "scrape failed");
            if attempt >= max_attempts {
                return Err(WorkflowError::RetryLimitExceeded {
                    subject: url.to_string(),
                    scope: RetryScope::Phase(Phase::Raw),
                    attempts: attempt,
                    last_error: failure.to_string(),
                });
            }
            if !err.is_retryable() {
                return Err(failure);
            }
            self.backoff().await;
        }
    }

    async fn call_adapter<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, AdapterError>>,
    ) -> std::result::Result<T, AdapterError> {
        match tokio::time::timeout(self.config.adapter_timeout(), call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AdapterError::Timeout),
        }
    }

    async fn backoff(&self) {
        let backoff = self.config.retry_backoff();
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }
}

fn is_suspended(chapter: &Chapter) -> bool {
    chapter.is_terminal() || chapter.state() == Phase::HumanReviewPending
}

fn new_chapter_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("ch_{}", &id[..12])
}
