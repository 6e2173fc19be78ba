use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapters::GenerationMode;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Pipeline phase. The first five plus `Finalized` tag stored versions;
/// `HumanReviewPending` and `Abandoned` only ever describe a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Raw,
    Drafted,
    Spun,
    AiReviewed,
    HumanReviewPending,
    Finalized,
    Abandoned,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Drafted => "DRAFTED",
            Self::Spun => "SPUN",
            Self::AiReviewed => "AI_REVIEWED",
            Self::HumanReviewPending => "HUMAN_REVIEW_PENDING",
            Self::Finalized => "FINALIZED",
            Self::Abandoned => "ABANDONED",
        }
    }

    /// Generator mode that produces this phase, if a generator produces it.
    pub fn generation_mode(self) -> Option<GenerationMode> {
        match self {
            Self::Drafted => Some(GenerationMode::Draft),
            Self::Spun => Some(GenerationMode::Spin),
            Self::AiReviewed => Some(GenerationMode::Review),
            _ => None,
        }
    }

    /// Phase whose latest version is the input when producing this phase.
    pub fn input_phase(self) -> Option<Phase> {
        match self {
            Self::Drafted => Some(Self::Raw),
            Self::Spun => Some(Self::Drafted),
            Self::AiReviewed => Some(Self::Spun),
            _ => None,
        }
    }

    pub fn producing_agent(self) -> AgentKind {
        match self {
            Self::Raw => AgentKind::Scraper,
            Self::Drafted => AgentKind::Drafter,
            Self::Spun => AgentKind::Spinner,
            Self::AiReviewed => AgentKind::AutoReviewer,
            Self::HumanReviewPending | Self::Finalized | Self::Abandoned => AgentKind::System,
        }
    }

    pub fn tags_versions(self) -> bool {
        !matches!(self, Self::HumanReviewPending | Self::Abandoned)
    }

    /// Phases a rejected chapter may be sent back to.
    pub fn is_reentry_target(self) -> bool {
        matches!(self, Self::Drafted | Self::Spun)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "RAW" => Ok(Self::Raw),
            "DRAFTED" => Ok(Self::Drafted),
            "SPUN" => Ok(Self::Spun),
            "AI_REVIEWED" => Ok(Self::AiReviewed),
            "HUMAN_REVIEW_PENDING" => Ok(Self::HumanReviewPending),
            "FINALIZED" => Ok(Self::Finalized),
            "ABANDONED" => Ok(Self::Abandoned),
            _ => Err(format!("unknown phase: {raw}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Scraper,
    Drafter,
    Spinner,
    AutoReviewer,
    Human,
    System,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scraper => "scraper",
            Self::Drafter => "drafter",
            Self::Spinner => "spinner",
            Self::AutoReviewer => "auto_reviewer",
            Self::Human => "human",
            Self::System => "system",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chapter id plus 1-based sequence number, rendered `<chapter>/<seq:06>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId {
    pub chapter_id: String,
    pub sequence: u64,
}

impl VersionId {
    pub fn new(chapter_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            sequence,
        }
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:06}", self.chapter_id, self.sequence)
    }
}

impl FromStr for VersionId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (chapter_id, sequence) = raw
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| format!("version id must look like <chapter>/<sequence>: {raw}"))?;
        if chapter_id.is_empty() {
            return Err(format!("version id has empty chapter id: {raw}"));
        }
        let sequence = sequence
            .parse::<u64>()
            .map_err(|err| format!("invalid version sequence in {raw}: {err}"))?;
        if sequence == 0 {
            return Err(format!("version sequence must start at 1: {raw}"));
        }
        Ok(Self::new(chapter_id, sequence))
    }
}

impl TryFrom<String> for VersionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.to_string()
    }
}

/// Immutable snapshot of a chapter at one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterVersion {
    pub id: VersionId,
    pub chapter_id: String,
    pub sequence: u64,
    pub phase: Phase,
    pub agent: AgentKind,
    pub content: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<VersionId>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A version before the content store assigns its identity.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub phase: Phase,
    pub agent: AgentKind,
    pub content: String,
    pub parent: Option<VersionId>,
    pub metadata: Metadata,
    /// Precomputed embedding; the store embeds the content itself when absent.
    pub embedding: Option<Vec<f32>>,
}

impl NewVersion {
    pub fn new(phase: Phase, agent: AgentKind, content: impl Into<String>) -> Self {
        Self {
            phase,
            agent,
            content: content.into(),
            parent: None,
            metadata: Metadata::new(),
            embedding: None,
        }
    }

    pub fn with_parent(mut self, parent: &VersionId) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Active,
    Finalized,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub id: VersionId,
    pub sequence: u64,
    pub phase: Phase,
}

/// Aggregate root tracked through the pipeline. Only the workflow engine
/// writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub status: ChapterStatus,
    /// Phase tag of the latest stored version.
    pub current_phase: Phase,
    pub versions: Vec<VersionRef>,

    /// Consecutive failed attempts at producing each phase.
    #[serde(default)]
    pub phase_attempts: BTreeMap<Phase, u32>,
    #[serde(default)]
    pub rejections: u32,
    #[serde(default)]
    pub ai_revisions: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_review: Option<String>,
    /// Phase to re-run on the next advance, set by a rejection or a revise
    /// verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reentry: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_notes: Option<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Chapter {
    pub fn from_raw(
        raw: &ChapterVersion,
        title: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        let mut chapter = Self {
            id: raw.chapter_id.clone(),
            title: title.into(),
            source_url: source_url.into(),
            status: ChapterStatus::Active,
            current_phase: raw.phase,
            versions: Vec::new(),
            phase_attempts: BTreeMap::new(),
            rejections: 0,
            ai_revisions: 0,
            open_review: None,
            reentry: None,
            revision_notes: None,
            themes: Vec::new(),
            last_error: None,
            created_at: raw.created_at,
            updated_at: raw.created_at,
            finalized_at: None,
        };
        chapter.record_version(raw);
        chapter
    }

    /// State-machine state derived from status, open review, and the latest
    /// version's phase.
    pub fn state(&self) -> Phase {
        match self.status {
            ChapterStatus::Abandoned => Phase::Abandoned,
            ChapterStatus::Finalized => Phase::Finalized,
            ChapterStatus::Active if self.open_review.is_some() => Phase::HumanReviewPending,
            ChapterStatus::Active => self.current_phase,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ChapterStatus::Active
    }

    pub fn record_version(&mut self, version: &ChapterVersion) {
        self.versions.push(VersionRef {
            id: version.id.clone(),
            sequence: version.sequence,
            phase: version.phase,
        });
        self.current_phase = version.phase;
        self.updated_at = version.created_at;
    }

    pub fn latest_version(&self) -> Option<&VersionRef> {
        self.versions.last()
    }

    pub fn latest_in_phase(&self, phase: Phase) -> Option<&VersionRef> {
        self.versions.iter().rev().find(|v| v.phase == phase)
    }

    pub fn attempts(&self, phase: Phase) -> u32 {
        self.phase_attempts.get(&phase).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

/// Human verdict on a review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reenter_at: Option<Phase>,
    },
}

impl Decision {
    pub fn status(self) -> ReviewStatus {
        match self {
            Self::Approve => ReviewStatus::Approved,
            Self::Reject { .. } => ReviewStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
}

impl ReviewPayload {
    /// Edited content, ignoring blank submissions.
    pub fn edited(&self) -> Option<&str> {
        self.edited_content
            .as_deref()
            .filter(|content| !content.trim().is_empty())
    }

    pub fn feedback(&self) -> Option<&str> {
        self.feedback
            .as_deref()
            .map(str::trim)
            .filter(|feedback| !feedback.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: String,
    pub chapter_id: String,
    pub version_id: VersionId,
    pub status: ReviewStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub payload: ReviewPayload,
}

impl ReviewRequest {
    pub fn is_open(&self) -> bool {
        self.status == ReviewStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_id_renders_and_parses() {
        let id = VersionId::new("c0ffee", 7);
        assert_eq!(id.to_string(), "c0ffee/000007");
        assert_eq!("c0ffee/000007".parse::<VersionId>().unwrap(), id);
        assert!("c0ffee/0".parse::<VersionId>().is_err());
        assert!("no-separator".parse::<VersionId>().is_err());
    }

    #[test]
    fn phase_parses_cli_spellings() {
        assert_eq!("spun".parse::<Phase>().unwrap(), Phase::Spun);
        assert_eq!("ai-reviewed".parse::<Phase>().unwrap(), Phase::AiReviewed);
        assert!("published".parse::<Phase>().is_err());
    }

    #[test]
    fn chapter_state_overlays_open_review_and_status() {
        let raw = ChapterVersion {
            id: VersionId::new("c1", 1),
            chapter_id: "c1".to_owned(),
            sequence: 1,
            phase: Phase::Raw,
            agent: AgentKind::Scraper,
            content: "text".to_owned(),
            content_hash: String::new(),
            parent: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        };
        let mut chapter = Chapter::from_raw(&raw, "T", "https://example.com/");
        assert_eq!(chapter.state(), Phase::Raw);

        chapter.current_phase = Phase::AiReviewed;
        chapter.open_review = Some("r1".to_owned());
        assert_eq!(chapter.state(), Phase::HumanReviewPending);

        chapter.status = ChapterStatus::Abandoned;
        assert_eq!(chapter.state(), Phase::Abandoned);
    }

    #[test]
    fn decision_serializes_with_tag() {
        let json = serde_json::to_value(Decision::Reject {
            reenter_at: Some(Phase::Drafted),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"decision": "reject", "reenter_at": "DRAFTED"})
        );
    }
}
