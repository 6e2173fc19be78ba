use std::path::{Path, PathBuf};

use anyhow::Context as _;
use tokio::fs;

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse json: {}", path.display()))?;
    Ok(Some(value))
}

/// Replaces `path` atomically via a temp file and rename.
pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let tmp_path = write_tmp(path, value).await?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

/// Publishes `value` at `path` only if nothing exists there yet. Returns
/// `false` when the path is already taken. The hard link makes the file
/// appear complete or not at all.
pub(crate) async fn create_json_new<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> anyhow::Result<bool> {
    let tmp_path = write_tmp(path, value).await?;
    let linked = fs::hard_link(&tmp_path, path).await;
    if let Err(err) = fs::remove_file(&tmp_path).await {
        tracing::warn!(path = %tmp_path.display(), ?err, "failed to remove temp file");
    }
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publish: {}", path.display())),
    }
}

/// `*.json` files directly under `dir`, sorted by name. A missing directory
/// is empty.
pub(crate) async fn list_json_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read dir: {}", dir.display())),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("list dir: {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) async fn list_subdirs(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read dir: {}", dir.display())),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("list dir: {}", dir.display()))?
    {
        if entry.file_type().await.context("read file type")?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Ids become file and directory names.
pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

async fn write_tmp<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    Ok(tmp_path)
}
