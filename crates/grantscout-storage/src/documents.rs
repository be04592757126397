//! Generated documents (reports and their converted copies) in one output directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;

const MAX_CONTEXT_CHARS: usize = 300;
const MAX_MATCHES_PER_DOCUMENT: usize = 5;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Markdown,
    Html,
}

impl DocumentKind {
    fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".md") {
            Some(DocumentKind::Markdown)
        } else if lower.ends_with(".html") {
            Some(DocumentKind::Html)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub filename: String,
    pub kind: DocumentKind,
    pub size_bytes: u64,
    pub size_readable: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentContent {
    pub filename: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub word_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSearchHit {
    pub filename: String,
    pub matches: Vec<String>,
    pub match_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentStatistics {
    pub total_documents: usize,
    pub total_size_bytes: u64,
    pub total_size_readable: String,
    pub oldest_document: Option<String>,
    pub newest_document: Option<String>,
    pub average_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dir(&self) -> Result<(), DocumentError> {
        fs::create_dir_all(&self.root).await.map_err(|source| DocumentError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// All `.md`/`.html` documents, newest first.
    pub async fn list_all(&self) -> Result<Vec<DocumentSummary>, DocumentError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(source) => {
                return Err(DocumentError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        let io_err = |source: std::io::Error| DocumentError::Io {
            path: self.root.clone(),
            source,
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let filename = entry.file_name().to_string_lossy().to_string();
            // Staging files are dot-prefixed and never listed.
            if filename.starts_with('.') {
                continue;
            }
            let Some(kind) = DocumentKind::from_filename(&filename) else {
                continue;
            };
            let meta = entry.metadata().await.map_err(io_err)?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().map_err(io_err)?;
            let created = meta.created().unwrap_or(modified);
            out.push(DocumentSummary {
                filename,
                kind,
                size_bytes: meta.len(),
                size_readable: format_size(meta.len()),
                created_at: to_utc(created),
                modified_at: to_utc(modified),
            });
        }
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(out)
    }

    pub async fn list(&self, limit: usize) -> Result<(Vec<DocumentSummary>, usize), DocumentError> {
        let all = self.list_all().await?;
        let total = all.len();
        Ok((all.into_iter().take(limit).collect(), total))
    }

    pub async fn read(&self, filename: &str) -> Result<Option<DocumentContent>, DocumentError> {
        let Some(filename) = resolve_filename(filename) else {
            return Ok(None);
        };
        let path = self.root.join(&filename);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DocumentError::Io { path, source }),
        };
        let meta = fs::metadata(&path)
            .await
            .map_err(|source| DocumentError::Io { path: path.clone(), source })?;
        let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
        Ok(Some(DocumentContent {
            word_count: content.split_whitespace().count(),
            filename,
            content,
            created_at: to_utc(meta.created().unwrap_or(modified)),
            size_bytes: meta.len(),
        }))
    }

    /// Most recent markdown report.
    pub async fn latest(&self) -> Result<Option<DocumentContent>, DocumentError> {
        let newest = self
            .list_all()
            .await?
            .into_iter()
            .find(|d| d.kind == DocumentKind::Markdown);
        match newest {
            Some(doc) => self.read(&doc.filename).await,
            None => Ok(None),
        }
    }

    pub async fn delete(&self, filename: &str) -> Result<bool, DocumentError> {
        let Some(filename) = resolve_filename(filename) else {
            return Ok(false);
        };
        let path = self.root.join(filename);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(DocumentError::Io { path, source }),
        }
    }

    /// Scans the newest `limit` markdown documents for `keyword`.
    pub async fn search(&self, keyword: &str, limit: usize) -> Result<Vec<DocumentSearchHit>, DocumentError> {
        let mut markdown: Vec<DocumentSummary> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|d| d.kind == DocumentKind::Markdown)
            .collect();
        markdown.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));

        let mut hits = Vec::new();
        for doc in markdown.into_iter().take(limit) {
            let Some(content) = self.read(&doc.filename).await? else {
                continue;
            };
            let (matches, match_count) = search_lines(&content.content, keyword);
            if match_count > 0 {
                hits.push(DocumentSearchHit {
                    filename: doc.filename,
                    matches,
                    match_count,
                });
            }
        }
        Ok(hits)
    }

    pub async fn statistics(&self) -> Result<DocumentStatistics, DocumentError> {
        let all = self.list_all().await?;
        let total_size_bytes: u64 = all.iter().map(|d| d.size_bytes).sum();
        let average_size_bytes = if all.is_empty() {
            0
        } else {
            total_size_bytes / all.len() as u64
        };
        Ok(DocumentStatistics {
            total_documents: all.len(),
            total_size_bytes,
            total_size_readable: format_size(total_size_bytes),
            oldest_document: all.last().map(|d| d.filename.clone()),
            newest_document: all.first().map(|d| d.filename.clone()),
            average_size_bytes,
        })
    }
}

/// Rejects path traversal and appends `.md` when no known extension is given.
pub fn resolve_filename(filename: &str) -> Option<String> {
    if filename.is_empty() || filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return None;
    }
    if DocumentKind::from_filename(filename).is_some() {
        Some(filename.to_string())
    } else {
        Some(format!("{filename}.md"))
    }
}

/// Case-insensitive line search returning up to five context windows and the total hit count.
pub fn search_lines(content: &str, keyword: &str) -> (Vec<String>, usize) {
    let needle = keyword.to_lowercase();
    let lines: Vec<&str> = content.lines().collect();
    let mut matches = Vec::new();
    let mut count = 0;
    for (i, line) in lines.iter().enumerate() {
        if !line.to_lowercase().contains(&needle) {
            continue;
        }
        count += 1;
        if matches.len() >= MAX_MATCHES_PER_DOCUMENT {
            continue;
        }
        let start = i.saturating_sub(1);
        let end = (i + 2).min(lines.len());
        let mut context = lines[start..end].join(" ").trim().to_string();
        if context.chars().count() > MAX_CONTEXT_CHARS {
            context = context.chars().take(MAX_CONTEXT_CHARS).collect::<String>() + "...";
        }
        matches.push(context);
    }
    (matches, count)
}

pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} TB")
}

fn to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn traversal_is_rejected_and_extension_defaulted() {
        assert_eq!(resolve_filename("../etc/passwd"), None);
        assert_eq!(resolve_filename("a/b.md"), None);
        assert_eq!(resolve_filename("report").as_deref(), Some("report.md"));
        assert_eq!(resolve_filename("report.html").as_deref(), Some("report.html"));
    }

    #[test]
    fn search_lines_returns_context_windows() {
        let text = "intro\nQuantum sensing grant\noutro\nnothing\nquantum again";
        let (matches, count) = search_lines(text, "QUANTUM");
        assert_eq!(count, 2);
        assert_eq!(matches[0], "intro Quantum sensing grant outro");
        assert_eq!(matches[1], "nothing quantum again");
    }

    #[test]
    fn search_lines_caps_matches_and_context_length() {
        let long = "x".repeat(400);
        let text = (0..8).map(|_| format!("hit {long}")).collect::<Vec<_>>().join("\n");
        let (matches, count) = search_lines(&text, "hit");
        assert_eq!(count, 8);
        assert_eq!(matches.len(), 5);
        assert!(matches[0].ends_with("..."));
        assert_eq!(matches[0].chars().count(), MAX_CONTEXT_CHARS + 3);
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }

    #[tokio::test]
    async fn list_read_delete_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let store = DocumentStore::new(dir.path());
        std::fs::write(dir.path().join("Report_A.md"), "# Title\nsome words here").expect("write");
        std::fs::write(dir.path().join("Report_A.html"), "<p>x</p>").expect("write");
        std::fs::write(dir.path().join(".staging.json"), "[]").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let (docs, total) = store.list(10).await.expect("list");
        assert_eq!(total, 2);
        assert!(docs.iter().any(|d| d.kind == DocumentKind::Html));

        let doc = store.read("Report_A").await.expect("read").expect("exists");
        assert_eq!(doc.word_count, 5);

        let latest = store.latest().await.expect("latest").expect("some");
        assert_eq!(latest.filename, "Report_A.md");

        assert!(store.delete("Report_A.md").await.expect("delete"));
        assert!(!store.delete("Report_A.md").await.expect("delete again"));
        assert!(store.read("Report_A.md").await.expect("read").is_none());

        let stats = store.statistics().await.expect("stats");
        assert_eq!(stats.total_documents, 1);
    }

    #[tokio::test]
    async fn missing_directory_lists_empty() {
        let dir = tempdir().expect("tempdir");
        let store = DocumentStore::new(dir.path().join("nope"));
        assert!(store.list_all().await.expect("list").is_empty());
        assert!(store.search("x", 10).await.expect("search").is_empty());
    }
}
