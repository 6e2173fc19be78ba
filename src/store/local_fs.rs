use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::Mutex;

use super::embed::{Embedder, EmbedderProfile, cosine};
use super::{ContentStore, SearchHit, SearchOptions, StoreStatistics};
use crate::error::{Result, WorkflowError};
use crate::json_fs::{
    create_json_new, is_safe_id, list_json_files, list_subdirs, read_json, write_json_atomic,
};
use crate::locks::KeyedLocks;
use crate::model::{ChapterVersion, NewVersion, Phase, VersionId};

/// Versions live at `versions/<chapter>/<seq:06>.json`; the similarity index
/// at `index/profile.json` plus the append-only `index/vectors.jsonl`.
pub struct LocalFsContentStore {
    base_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    profile: EmbedderProfile,
    chapter_locks: KeyedLocks,
    index: Mutex<BTreeMap<VersionId, IndexEntry>>,
}

impl std::fmt::Debug for LocalFsContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFsContentStore")
            .field("base_dir", &self.base_dir)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    version_id: VersionId,
    phase: Phase,
    vector: Vec<f32>,
}

impl LocalFsContentStore {
    /// Opens (or initializes) the store. Fails with `IncompatibleIndex` when
    /// the persisted index was built by a different embedder.
    pub async fn open(base_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        Self::open_inner(base_dir.into(), embedder, false).await
    }

    /// Like [`open`](Self::open), but rebuilds an incompatible index instead
    /// of failing.
    pub async fn open_with_rebuild(
        base_dir: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        Self::open_inner(base_dir.into(), embedder, true).await
    }

    async fn open_inner(
        base_dir: PathBuf,
        embedder: Arc<dyn Embedder>,
        rebuild_on_mismatch: bool,
    ) -> Result<Self> {
        let profile = embedder.profile();
        let store = Self {
            base_dir,
            embedder,
            profile,
            chapter_locks: KeyedLocks::new(),
            index: Mutex::new(BTreeMap::new()),
        };

        let stored_profile: Option<EmbedderProfile> = read_json(&store.profile_path()).await?;
        match stored_profile {
            Some(stored) if stored == store.profile => {
                store.load_index().await?;
                store.repair_index().await?;
            }
            Some(stored) if rebuild_on_mismatch => {
                tracing::warn!(
                    stored = %stored,
                    current = %store.profile,
                    "similarity index built by a different embedder; rebuilding"
                );
                store.rebuild_index().await?;
            }
            Some(stored) => {
                return Err(WorkflowError::IncompatibleIndex {
                    detail: format!(
                        "index was built with {stored}, store opened with {}; run reindex",
                        store.profile
                    ),
                });
            }
            None => {
                store.rebuild_index().await?;
            }
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn versions_dir(&self) -> PathBuf {
        self.base_dir.join("versions")
    }

    fn chapter_dir(&self, chapter_id: &str) -> PathBuf {
        self.versions_dir().join(chapter_id)
    }

    fn version_path(&self, id: &VersionId) -> PathBuf {
        self.chapter_dir(&id.chapter_id)
            .join(format!("{:06}.json", id.sequence))
    }

    fn index_dir(&self) -> PathBuf {
        self.base_dir.join("index")
    }

    fn profile_path(&self) -> PathBuf {
        self.index_dir().join("profile.json")
    }

    fn vectors_path(&self) -> PathBuf {
        self.index_dir().join("vectors.jsonl")
    }

    async fn read_history(&self, chapter_id: &str) -> Result<Vec<ChapterVersion>> {
        if !is_safe_id(chapter_id) {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for path in list_json_files(&self.chapter_dir(chapter_id)).await? {
            let version: Option<ChapterVersion> = read_json(&path).await?;
            versions.extend(version);
        }
        versions.sort_by_key(|v| v.sequence);
        Ok(versions)
    }

    async fn next_sequence(&self, chapter_id: &str) -> Result<u64> {
        let files = list_json_files(&self.chapter_dir(chapter_id)).await?;
        let max = files
            .iter()
            .filter_map(|path| path.file_stem()?.to_str()?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    fn check_dimensions(&self, vector: &[f32], what: &str) -> Result<()> {
        if vector.len() != self.profile.dimensions {
            return Err(WorkflowError::IncompatibleIndex {
                detail: format!(
                    "{what} has {} dimensions, index expects {}",
                    vector.len(),
                    self.profile.dimensions
                ),
            });
        }
        Ok(())
    }

    async fn load_index(&self) -> Result<()> {
        let path = self.vectors_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("read index: {}", path.display()))
                    .into());
            }
        };

        let mut entries = BTreeMap::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(err) => {
                    // Torn append; repair re-embeds whatever it covered.
                    tracing::warn!(line = line_no + 1, %err, "skipping unreadable index entry");
                    continue;
                }
            };
            self.check_dimensions(&entry.vector, &format!("index entry {}", entry.version_id))?;
            entries.insert(entry.version_id.clone(), entry);
        }

        *self.index.lock().await = entries;
        Ok(())
    }

    /// Indexes versions that were written but never made it into the index.
    async fn repair_index(&self) -> Result<usize> {
        let mut index = self.index.lock().await;
        let mut missing = Vec::new();
        for chapter_id in list_subdirs(&self.versions_dir()).await? {
            for version in self.read_history(&chapter_id).await? {
                if !index.contains_key(&version.id) {
                    missing.push(IndexEntry {
                        vector: self.embedder.embed(&version.content),
                        version_id: version.id,
                        phase: version.phase,
                    });
                }
            }
        }

        let repaired = missing.len();
        for entry in missing {
            self.append_index_entry(&entry).await?;
            index.insert(entry.version_id.clone(), entry);
        }
        if repaired > 0 {
            tracing::info!(repaired, "indexed versions missing from similarity index");
        }
        Ok(repaired)
    }

    async fn append_index_entry(&self, entry: &IndexEntry) -> Result<()> {
        let path = self.vectors_path();
        tokio::fs::create_dir_all(self.index_dir())
            .await
            .with_context(|| format!("create index dir: {}", self.index_dir().display()))?;
        let mut line = serde_json::to_string(entry).context("serialize index entry")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open index: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("append index: {}", path.display()))?;
        file.flush().await.context("flush index")?;
        Ok(())
    }
}

#[async_trait]
impl ContentStore for LocalFsContentStore {
    async fn put_version(&self, chapter_id: &str, version: NewVersion) -> Result<ChapterVersion> {
        if !is_safe_id(chapter_id) {
            return Err(anyhow::anyhow!("invalid chapter id: {chapter_id:?}").into());
        }
        if !version.phase.tags_versions() {
            return Err(WorkflowError::invalid_state(
                chapter_id,
                "store version for",
                format!("{} never tags a version", version.phase),
            ));
        }
        if let Some(embedding) = &version.embedding {
            self.check_dimensions(embedding, "supplied embedding")?;
        }

        let _guard = self.chapter_locks.lock(chapter_id).await;

        let sequence = self.next_sequence(chapter_id).await?;
        let id = VersionId::new(chapter_id, sequence);
        let stored = ChapterVersion {
            id: id.clone(),
            chapter_id: chapter_id.to_owned(),
            sequence,
            phase: version.phase,
            agent: version.agent,
            content_hash: content_hash(&version.content),
            content: version.content,
            parent: version.parent,
            metadata: version.metadata,
            created_at: chrono::Utc::now(),
        };

        let path = self.version_path(&id);
        if !create_json_new(&path, &stored).await? {
            return Err(anyhow::anyhow!("version already exists: {}", path.display()).into());
        }

        let entry = IndexEntry {
            version_id: id.clone(),
            phase: stored.phase,
            vector: version
                .embedding
                .unwrap_or_else(|| self.embedder.embed(&stored.content)),
        };
        let mut index = self.index.lock().await;
        match self.append_index_entry(&entry).await {
            Ok(()) => {
                index.insert(id.clone(), entry);
            }
            Err(err) => {
                tracing::warn!(
                    version_id = %id,
                    %err,
                    "index append failed; repaired on next open"
                );
            }
        }
        drop(index);

        tracing::debug!(
            version_id = %id,
            phase = %stored.phase,
            agent = %stored.agent,
            "stored version"
        );
        Ok(stored)
    }

    async fn get_version(&self, id: &VersionId) -> Result<ChapterVersion> {
        if !is_safe_id(&id.chapter_id) {
            return Err(WorkflowError::not_found("version", id.to_string()));
        }
        read_json(&self.version_path(id))
            .await?
            .ok_or_else(|| WorkflowError::not_found("version", id.to_string()))
    }

    async fn get_history(&self, chapter_id: &str) -> Result<Vec<ChapterVersion>> {
        self.read_history(chapter_id).await
    }

    async fn get_latest(&self, chapter_id: &str) -> Result<ChapterVersion> {
        self.read_history(chapter_id)
            .await?
            .pop()
            .ok_or_else(|| WorkflowError::not_found("chapter versions", chapter_id))
    }

    async fn chapter_ids(&self) -> Result<Vec<String>> {
        Ok(list_subdirs(&self.versions_dir()).await?)
    }

    async fn search_with(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        if options.k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(query);

        let mut scored: Vec<(f32, VersionId)> = {
            let index = self.index.lock().await;
            index
                .values()
                .filter(|entry| {
                    options
                        .chapter_id
                        .as_deref()
                        .is_none_or(|c| entry.version_id.chapter_id == c)
                })
                .filter(|entry| options.phase.is_none_or(|p| entry.phase == p))
                .map(|entry| (cosine(&query_vector, &entry.vector), entry.version_id.clone()))
                .filter(|(score, _)| options.min_score.is_none_or(|min| *score >= min))
                .collect()
        };
        scored.sort_by(|(sa, ia), (sb, ib)| sb.total_cmp(sa).then_with(|| ia.cmp(ib)));
        scored.truncate(options.k);

        let mut hits = Vec::with_capacity(scored.len());
        for (score, id) in scored {
            hits.push(SearchHit {
                version: self.get_version(&id).await?,
                score,
            });
        }
        Ok(hits)
    }

    async fn statistics(&self) -> Result<StoreStatistics> {
        let mut stats = StoreStatistics {
            total_versions: 0,
            chapters: 0,
            by_phase: BTreeMap::new(),
            by_agent: BTreeMap::new(),
            by_chapter: BTreeMap::new(),
            index_profile: self.profile.clone(),
            indexed_versions: self.index.lock().await.len(),
        };
        for chapter_id in self.chapter_ids().await? {
            let history = self.read_history(&chapter_id).await?;
            stats.chapters += 1;
            stats.total_versions += history.len();
            stats.by_chapter.insert(chapter_id, history.len());
            for version in history {
                *stats.by_phase.entry(version.phase).or_default() += 1;
                *stats.by_agent.entry(version.agent).or_default() += 1;
            }
        }
        Ok(stats)
    }

    async fn rebuild_index(&self) -> Result<usize> {
        let mut index = self.index.lock().await;

        let mut entries = BTreeMap::new();
        for chapter_id in list_subdirs(&self.versions_dir()).await? {
            for version in self.read_history(&chapter_id).await? {
                let vector = self.embedder.embed(&version.content);
                entries.insert(
                    version.id.clone(),
                    IndexEntry {
                        version_id: version.id,
                        phase: version.phase,
                        vector,
                    },
                );
            }
        }

        let mut data = String::new();
        for entry in entries.values() {
            data.push_str(&serde_json::to_string(entry).context("serialize index entry")?);
            data.push('\n');
        }
        tokio::fs::create_dir_all(self.index_dir())
            .await
            .with_context(|| format!("create index dir: {}", self.index_dir().display()))?;
        let tmp = self
            .vectors_path()
            .with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("write index: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, self.vectors_path())
            .await
            .context("replace index")?;
        write_json_atomic(&self.profile_path(), &self.profile).await?;

        let count = entries.len();
        *index = entries;
        tracing::info!(count, profile = %self.profile, "rebuilt similarity index");
        Ok(count)
    }
}

pub(crate) fn content_hash(content: &str) -> String {
    hex::encode(sha2::Sha256::digest(content.as_bytes()))
}
