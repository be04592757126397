//! File-backed keyword store.
//!
//! The JSON file is the only source of truth: every call reads it fresh and
//! every mutation rewrites it with a temp-file rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use grantscout_core::{KeywordSet, NEGATIVE_DOMAIN};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum KeywordStoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("keyword file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("domain '{0}' already exists")]
    DomainExists(String),
    #[error("domain name must not be empty")]
    EmptyDomain,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeywordFile {
    #[serde(default)]
    keywords: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    last_updated: Option<String>,
    #[serde(default)]
    total_domains: usize,
    #[serde(default)]
    total_keywords: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordDomain {
    pub name: String,
    pub keywords: Vec<String>,
    pub count: usize,
}

impl KeywordDomain {
    fn new(name: &str, keywords: &[String]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.to_vec(),
            count: keywords.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeywordOverview {
    pub domains: Vec<KeywordDomain>,
    pub total_domains: usize,
    pub total_keywords: usize,
    pub last_updated: Option<DateTime<Local>>,
    pub negative_keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct KeywordStore {
    path: PathBuf,
}

impl KeywordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<KeywordFile, KeywordStoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(KeywordFile::default())
            }
            Err(source) => {
                return Err(KeywordStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| KeywordStoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    async fn save(&self, mut data: KeywordFile) -> Result<(), KeywordStoreError> {
        data.last_updated = Some(Local::now().to_rfc3339());
        data.total_domains = data
            .keywords
            .keys()
            .filter(|name| name.as_str() != NEGATIVE_DOMAIN)
            .count();
        data.total_keywords = data.keywords.values().map(Vec::len).sum();

        let io_err = |source: std::io::Error| KeywordStoreError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(&data).map_err(|source| KeywordStoreError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.keywords.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }
        debug!(path = %self.path.display(), domains = data.total_domains, "keyword file saved");
        Ok(())
    }

    /// Raw mapping, including the negative domain.
    pub async fn get_all(&self) -> Result<BTreeMap<String, Vec<String>>, KeywordStoreError> {
        Ok(self.load().await?.keywords)
    }

    pub async fn overview(&self) -> Result<KeywordOverview, KeywordStoreError> {
        let data = self.load().await?;
        let mut domains = Vec::new();
        let mut negative_keywords = None;
        for (name, keywords) in &data.keywords {
            if name == NEGATIVE_DOMAIN {
                negative_keywords = Some(keywords.clone());
            } else {
                domains.push(KeywordDomain::new(name, keywords));
            }
        }
        let last_updated = data
            .last_updated
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Local));

        Ok(KeywordOverview {
            total_domains: domains.len(),
            total_keywords: domains.iter().map(|d| d.count).sum(),
            domains,
            last_updated,
            negative_keywords,
        })
    }

    /// Domain names excluding the reserved negative domain.
    pub async fn domain_names(&self) -> Result<Vec<String>, KeywordStoreError> {
        Ok(self
            .load()
            .await?
            .keywords
            .into_keys()
            .filter(|name| name != NEGATIVE_DOMAIN)
            .collect())
    }

    pub async fn get_domain(&self, name: &str) -> Result<Option<KeywordDomain>, KeywordStoreError> {
        let data = self.load().await?;
        Ok(data
            .keywords
            .get(name)
            .map(|keywords| KeywordDomain::new(name, keywords)))
    }

    /// Replaces a domain's keywords, or appends the unseen ones when `append` is set.
    pub async fn set_domain(
        &self,
        name: &str,
        keywords: &[String],
        append: bool,
    ) -> Result<KeywordDomain, KeywordStoreError> {
        if name.trim().is_empty() {
            return Err(KeywordStoreError::EmptyDomain);
        }
        let mut data = self.load().await?;
        let entry = data.keywords.entry(name.to_string()).or_default();
        if !append {
            entry.clear();
        }
        push_unique(entry, keywords);
        let domain = KeywordDomain::new(name, entry);
        self.save(data).await?;
        Ok(domain)
    }

    pub async fn add_domain(
        &self,
        name: &str,
        keywords: &[String],
    ) -> Result<KeywordDomain, KeywordStoreError> {
        if name.trim().is_empty() {
            return Err(KeywordStoreError::EmptyDomain);
        }
        let mut data = self.load().await?;
        if data.keywords.contains_key(name) {
            return Err(KeywordStoreError::DomainExists(name.to_string()));
        }
        let mut list = Vec::new();
        push_unique(&mut list, keywords);
        let domain = KeywordDomain::new(name, &list);
        data.keywords.insert(name.to_string(), list);
        self.save(data).await?;
        Ok(domain)
    }

    pub async fn delete_domain(&self, name: &str) -> Result<bool, KeywordStoreError> {
        let mut data = self.load().await?;
        if data.keywords.remove(name).is_none() {
            return Ok(false);
        }
        self.save(data).await?;
        Ok(true)
    }

    pub async fn delete_keywords(
        &self,
        domain: &str,
        keywords: &[String],
    ) -> Result<Option<KeywordDomain>, KeywordStoreError> {
        let mut data = self.load().await?;
        let Some(list) = data.keywords.get_mut(domain) else {
            return Ok(None);
        };
        list.retain(|kw| !keywords.contains(kw));
        let updated = KeywordDomain::new(domain, list);
        self.save(data).await?;
        Ok(Some(updated))
    }

    /// Case-insensitive substring search, optionally limited to one domain.
    pub async fn search(
        &self,
        query: &str,
        domain: Option<&str>,
    ) -> Result<BTreeMap<String, Vec<String>>, KeywordStoreError> {
        let needle = query.to_lowercase();
        let data = self.load().await?;
        Ok(data
            .keywords
            .into_iter()
            .filter(|(name, _)| domain.map_or(true, |d| d == name))
            .filter_map(|(name, list)| {
                let hits: Vec<String> = list
                    .into_iter()
                    .filter(|kw| kw.to_lowercase().contains(&needle))
                    .collect();
                (!hits.is_empty()).then_some((name, hits))
            })
            .collect())
    }

    pub async fn get_negative(&self) -> Result<Vec<String>, KeywordStoreError> {
        Ok(self
            .load()
            .await?
            .keywords
            .remove(NEGATIVE_DOMAIN)
            .unwrap_or_default())
    }

    pub async fn set_negative(
        &self,
        keywords: &[String],
        append: bool,
    ) -> Result<Vec<String>, KeywordStoreError> {
        Ok(self.set_domain(NEGATIVE_DOMAIN, keywords, append).await?.keywords)
    }

    /// Keyword set for one run, restricted to `domains` when given.
    pub async fn keywords_for_run(
        &self,
        domains: Option<&[String]>,
    ) -> Result<KeywordSet, KeywordStoreError> {
        let mut all = self.load().await?.keywords;
        let negative = all.remove(NEGATIVE_DOMAIN).unwrap_or_default();
        if let Some(wanted) = domains {
            all.retain(|name, _| wanted.iter().any(|w| w == name));
        }
        Ok(KeywordSet {
            domains: all,
            negative,
        })
    }
}

fn push_unique(list: &mut Vec<String>, keywords: &[String]) {
    for kw in keywords {
        if !list.contains(kw) {
            list.push(kw.clone());
        }
    }
}
