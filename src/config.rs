use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::model::Phase;

pub const ENV_PREFIX: &str = "CHAPTERFLOW_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Noop,
    Openai,
    Command,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        <Self as clap::ValueEnum>::from_str(raw.trim(), true)
    }
}

/// Top-level configuration: defaults, then an optional YAML file, then
/// `CHAPTERFLOW_*` environment overrides. CLI flags are applied last by the
/// binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub engine: EngineKind,
    pub openai: OpenAiConfig,
    pub command: CommandConfig,
    pub scraper: ScraperConfig,
    pub index: IndexConfig,
    pub workflow: WorkflowConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("chapterflow-data"),
            engine: EngineKind::default(),
            openai: OpenAiConfig::default(),
            command: CommandConfig::default(),
            scraper: ScraperConfig::default(),
            index: IndexConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_owned(),
            model: "gpt-5-mini".to_owned(),
            temperature: 0.7,
            api_key_env: "OPENAI_API_KEY".to_owned(),
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScraperConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
    /// Keep a raw HTML copy of every scraped page under `snapshots/`.
    pub snapshots: bool,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("chapterflow/", env!("CARGO_PKG_VERSION")).to_owned(),
            snapshots: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub dimensions: usize,
    /// Hits scoring below this are dropped from search results.
    pub min_score: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    /// Attempts at producing one phase before the chapter is abandoned.
    pub max_attempts: u32,
    /// Human rejections before the chapter is abandoned.
    pub max_rejections: u32,
    /// Revise verdicts from the automated reviewer that are honored.
    pub max_ai_revisions: u32,
    pub adapter_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub require_human_review: bool,
    pub book_title: String,
    pub reentry: ReentryConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_rejections: 3,
            max_ai_revisions: 1,
            adapter_timeout_ms: 120_000,
            retry_backoff_ms: 250,
            require_human_review: true,
            book_title: "Untitled".to_owned(),
            reentry: ReentryConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("workflow.max_attempts must be > 0");
        }
        if self.max_rejections == 0 {
            anyhow::bail!("workflow.max_rejections must be > 0");
        }
        if self.adapter_timeout_ms == 0 {
            anyhow::bail!("workflow.adapter_timeout_ms must be > 0");
        }
        if !self.reentry.default_phase.is_reentry_target() {
            anyhow::bail!(
                "workflow.reentry.default_phase must be DRAFTED or SPUN, got {}",
                self.reentry.default_phase
            );
        }
        Ok(())
    }
}

/// Where a rejected chapter goes back to when the reviewer does not say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReentryConfig {
    pub default_phase: Phase,
    /// Feedback containing any of these (case-insensitive) sends the chapter
    /// back to `DRAFTED`.
    pub structural_markers: Vec<String>,
}

impl Default for ReentryConfig {
    fn default() -> Self {
        Self {
            default_phase: Phase::Spun,
            structural_markers: ["restructure", "structural", "reorganize", "outline"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid by `path` (YAML) when given, then by the process
    /// environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    /// Applies `CHAPTERFLOW_*` overrides looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = get("ENGINE") {
            self.engine = value
                .parse()
                .map_err(|err| anyhow::anyhow!("{ENV_PREFIX}ENGINE: {err}"))?;
        }
        if let Some(value) = get("OPENAI_BASE_URL") {
            self.openai.base_url = value;
        }
        if let Some(value) = get("OPENAI_MODEL") {
            self.openai.model = value;
        }
        if let Some(value) = get("COMMAND") {
            self.command.program = Some(value);
        }
        if let Some(value) = get("BOOK_TITLE") {
            self.workflow.book_title = value;
        }
        if let Some(value) = get("MAX_ATTEMPTS") {
            self.workflow.max_attempts = parse_env("MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("MAX_REJECTIONS") {
            self.workflow.max_rejections = parse_env("MAX_REJECTIONS", &value)?;
        }
        if let Some(value) = get("ADAPTER_TIMEOUT_MS") {
            self.workflow.adapter_timeout_ms = parse_env("ADAPTER_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("REQUIRE_HUMAN_REVIEW") {
            self.workflow.require_human_review = parse_env("REQUIRE_HUMAN_REVIEW", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.workflow.validate()?;
        if self.index.dimensions == 0 {
            anyhow::bail!("index.dimensions must be > 0");
        }
        if self.engine == EngineKind::Command && self.command.program.is_none() {
            anyhow::bail!("command.program is required when engine is `command`");
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid {ENV_PREFIX}{name}={value}: {err}"))
}
