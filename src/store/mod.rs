//! Append-only version ledger with a derived similarity index.

mod embed;
mod local_fs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

pub use embed::{Embedder, EmbedderProfile, HashingEmbedder, cosine};
pub use local_fs::LocalFsContentStore;

use crate::error::Result;
use crate::model::{AgentKind, ChapterVersion, NewVersion, Phase, VersionId};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub k: usize,
    pub chapter_id: Option<String>,
    pub phase: Option<Phase>,
    pub min_score: Option<f32>,
}

impl SearchOptions {
    pub fn top(k: usize) -> Self {
        Self {
            k,
            chapter_id: None,
            phase: None,
            min_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub version: ChapterVersion,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    pub total_versions: usize,
    pub chapters: usize,
    pub by_phase: BTreeMap<Phase, usize>,
    pub by_agent: BTreeMap<AgentKind, usize>,
    pub by_chapter: BTreeMap<String, usize>,
    pub index_profile: EmbedderProfile,
    pub indexed_versions: usize,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Appends a version under the next sequence number for `chapter_id`.
    /// Never overwrites an existing version.
    async fn put_version(&self, chapter_id: &str, version: NewVersion) -> Result<ChapterVersion>;

    async fn get_version(&self, id: &VersionId) -> Result<ChapterVersion>;

    /// All versions of a chapter in ascending sequence order.
    async fn get_history(&self, chapter_id: &str) -> Result<Vec<ChapterVersion>>;

    async fn get_latest(&self, chapter_id: &str) -> Result<ChapterVersion>;

    async fn chapter_ids(&self) -> Result<Vec<String>>;

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        self.search_with(query, &SearchOptions::top(k)).await
    }

    /// Hits ordered by descending score, ties by version id.
    async fn search_with(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>>;

    async fn statistics(&self) -> Result<StoreStatistics>;

    /// Re-embeds every stored version with the current embedder. Returns the
    /// number of versions indexed.
    async fn rebuild_index(&self) -> Result<usize>;
}
