use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::json_fs::{create_json_new, is_safe_id, list_subdirs, read_json, write_json_atomic};
use crate::model::Chapter;

/// Durable `Chapter` aggregates. Only the workflow engine writes here.
#[async_trait]
pub trait ChapterStore: Send + Sync {
    /// Fails if a chapter with the same id exists.
    async fn create(&self, chapter: &Chapter) -> anyhow::Result<()>;
    async fn get(&self, chapter_id: &str) -> anyhow::Result<Option<Chapter>>;
    async fn put(&self, chapter: &Chapter) -> anyhow::Result<()>;
    async fn list(&self) -> anyhow::Result<Vec<Chapter>>;
}

#[derive(Debug, Clone)]
pub struct LocalFsChapterStore {
    base_dir: PathBuf,
}

impl LocalFsChapterStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn chapters_dir(&self) -> PathBuf {
        self.base_dir.join("chapters")
    }

    fn chapter_json_path(&self, chapter_id: &str) -> PathBuf {
        self.chapters_dir().join(chapter_id).join("chapter.json")
    }
}

#[async_trait]
impl ChapterStore for LocalFsChapterStore {
    async fn create(&self, chapter: &Chapter) -> anyhow::Result<()> {
        anyhow::ensure!(is_safe_id(&chapter.id), "invalid chapter id: {:?}", chapter.id);
        let path = self.chapter_json_path(&chapter.id);
        if !create_json_new(&path, chapter)
            .await
            .context("write chapter.json")?
        {
            anyhow::bail!("chapter already exists: {}", chapter.id);
        }
        Ok(())
    }

    async fn get(&self, chapter_id: &str) -> anyhow::Result<Option<Chapter>> {
        if !is_safe_id(chapter_id) {
            return Ok(None);
        }
        read_json(&self.chapter_json_path(chapter_id)).await
    }

    async fn put(&self, chapter: &Chapter) -> anyhow::Result<()> {
        anyhow::ensure!(is_safe_id(&chapter.id), "invalid chapter id: {:?}", chapter.id);
        write_json_atomic(&self.chapter_json_path(&chapter.id), chapter)
            .await
            .context("write chapter.json")
    }

    /// Ordered by creation time, then id.
    async fn list(&self) -> anyhow::Result<Vec<Chapter>> {
        let mut chapters = Vec::new();
        for chapter_id in list_subdirs(&self.chapters_dir()).await? {
            if let Some(chapter) = self.get(&chapter_id).await? {
                chapters.push(chapter);
            }
        }
        chapters.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(chapters)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{AgentKind, ChapterVersion, Metadata, Phase, VersionId};

    fn chapter(id: &str) -> Chapter {
        let raw = ChapterVersion {
            id: VersionId::new(id, 1),
            chapter_id: id.to_owned(),
            sequence: 1,
            phase: Phase::Raw,
            agent: AgentKind::Scraper,
            content: "text".to_owned(),
            content_hash: String::new(),
            parent: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        };
        Chapter::from_raw(&raw, "Title", "https://example.com/")
    }

    #[tokio::test]
    async fn create_refuses_existing_and_put_replaces() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsChapterStore::new(temp.path());

        let mut ch = chapter("c1");
        store.create(&ch).await?;
        assert!(store.create(&ch).await.is_err());

        ch.rejections = 2;
        store.put(&ch).await?;
        let loaded = store.get("c1").await?.expect("stored");
        assert_eq!(loaded.rejections, 2);
        assert_eq!(store.list().await?.len(), 1);
        assert!(store.get("missing").await?.is_none());
        assert!(store.get("../c1").await?.is_none());
        Ok(())
    }
}
