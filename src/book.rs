use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChapterVersion, VersionId};

/// Read-only aggregation of finalized chapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub chapters: Vec<BookChapter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookChapter {
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub version_id: VersionId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<String>,
}

impl Book {
    /// One Markdown document: the book title as `#`, each chapter as `##`
    /// with its own headings demoted one level.
    pub fn render_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.title.trim());
        if self.chapters.is_empty() {
            out.push_str("_No finalized chapters yet._\n");
            return out;
        }

        for chapter in &self.chapters {
            let content = chapter.content.trim();
            if !starts_with_heading(content) {
                out.push_str(&format!("## {}\n\n", chapter.title.trim()));
            }
            out.push_str(&demote_headings(content));
            out.push_str(&format!(
                "\n\n<!-- chapter {} version {} source {} -->\n\n",
                chapter.id, chapter.version_id, chapter.source_url
            ));
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
        out
    }
}

fn starts_with_heading(content: &str) -> bool {
    content
        .lines()
        .next()
        .is_some_and(|line| line.starts_with("# "))
}

fn demote_headings(markdown: &str) -> String {
    let mut in_fence = false;
    markdown
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
                return line.to_owned();
            }
            if !in_fence && line.starts_with('#') {
                let level = line.chars().take_while(|c| *c == '#').count();
                if level < 6 && line[level..].starts_with(' ') {
                    return format!("#{line}");
                }
            }
            line.to_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    /// Also bundle everything into `publication.zip`.
    pub zip: bool,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub out_dir: PathBuf,
    pub files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<PathBuf>,
}

/// Writes `book.md`, `book.json` and `history/<chapter>.jsonl` under the
/// output directory.
pub fn export(
    book: &Book,
    histories: &BTreeMap<String, Vec<ChapterVersion>>,
    options: &ExportOptions,
) -> anyhow::Result<ExportSummary> {
    let out_dir = &options.out_dir;
    if out_dir.join("book.md").exists() && !options.force {
        anyhow::bail!(
            "publication output already exists: {} (use --force)",
            out_dir.display()
        );
    }
    let history_dir = out_dir.join("history");
    std::fs::create_dir_all(&history_dir)
        .with_context(|| format!("create export dir: {}", history_dir.display()))?;

    let mut files = Vec::new();

    let book_md = out_dir.join("book.md");
    write_file(&book_md, book.render_markdown().as_bytes())?;
    files.push(book_md);

    let book_json = out_dir.join("book.json");
    let json = serde_json::to_vec_pretty(book).context("serialize book")?;
    write_file(&book_json, &json)?;
    files.push(book_json);

    for (chapter_id, versions) in histories {
        let path = history_dir.join(format!("{chapter_id}.jsonl"));
        write_history_jsonl(&path, versions)?;
        files.push(path);
    }

    let zip_path = if options.zip {
        let zip_path = out_dir.join("publication.zip");
        create_zip(out_dir, &files, &zip_path)?;
        Some(zip_path)
    } else {
        None
    };

    Ok(ExportSummary {
        out_dir: out_dir.clone(),
        files,
        zip_path,
    })
}

/// One JSON version record per line, in sequence order.
pub fn write_history_jsonl(path: &Path, versions: &[ChapterVersion]) -> anyhow::Result<()> {
    let mut data = Vec::new();
    for version in versions {
        serde_json::to_writer(&mut data, version).context("serialize version")?;
        data.push(b'\n');
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create history dir: {}", parent.display()))?;
    }
    write_file(path, &data)
}

fn write_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open output: {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("write output: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("flush output: {}", path.display()))?;
    Ok(())
}

fn create_zip(base_dir: &Path, files: &[PathBuf], out_zip: &Path) -> anyhow::Result<()> {
    let file =
        File::create(out_zip).with_context(|| format!("create zip: {}", out_zip.display()))?;
    let mut zip = zip::ZipWriter::new(file);

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for path in files {
        let name = path
            .strip_prefix(base_dir)
            .with_context(|| format!("file outside export dir: {}", path.display()))?;
        let name = name.to_string_lossy().replace('\\', "/");
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("zip start_file {name}"))?;
        let mut input =
            File::open(path).with_context(|| format!("open for zip: {}", path.display()))?;
        io::copy(&mut input, &mut zip).with_context(|| format!("zip write {name}"))?;
    }

    zip.finish().context("zip finish")?;
    Ok(())
}
