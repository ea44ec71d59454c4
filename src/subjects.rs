//! Subject records (the companies being researched) and their storage.
//!
//! Subjects are owned by an external store; the engine only reads them. The
//! bundled [`JsonSubjectStore`] keeps them in a JSON file so the service can
//! run standalone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// A company to research.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    /// Primary web domain (e.g. "acme.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Subject {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            name: name.into(),
            domain: None,
            industry: None,
            location: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// URL-safe identifier derived from the name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }

    /// Known facts about the subject as markdown bullet lines.
    pub fn fact_sheet(&self) -> String {
        let mut lines = vec![format!("- Name: {}", self.name)];
        let optional = [
            ("Website", &self.domain),
            ("Industry", &self.industry),
            ("Location", &self.location),
            ("Description", &self.description),
        ];
        for (label, value) in optional {
            if let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                lines.push(format!("- {}: {}", label, value));
            }
        }
        lines.join("\n")
    }
}

/// Lowercase ASCII slug: alphanumerics kept, every other run collapsed to `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

#[derive(Debug, Error)]
pub enum SubjectError {
    #[error("subject {0} not found")]
    NotFound(i64),

    #[error("subject store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to subject records.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Subject, SubjectError>;
}

/// File-backed subject store.
#[derive(Debug)]
pub struct JsonSubjectStore {
    subjects: RwLock<HashMap<i64, Subject>>,
    storage_path: PathBuf,
}

impl JsonSubjectStore {
    /// Create a store, loading existing subjects from disk if the file exists.
    pub fn new(storage_path: PathBuf) -> Self {
        let subjects = match Self::load_from_path(&storage_path) {
            Ok(s) => {
                tracing::info!(
                    "Loaded {} subjects from {}",
                    s.len(),
                    storage_path.display()
                );
                s
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load subjects from {}: {}, starting empty",
                    storage_path.display(),
                    e
                );
                HashMap::new()
            }
        };

        Self {
            subjects: RwLock::new(subjects),
            storage_path,
        }
    }

    fn load_from_path(path: &PathBuf) -> Result<HashMap<i64, Subject>, std::io::Error> {
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let contents = std::fs::read_to_string(path)?;
        let subjects: Vec<Subject> = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        Ok(subjects.into_iter().map(|s| (s.id, s)).collect())
    }

    async fn save_to_disk(&self) -> Result<(), std::io::Error> {
        let subjects = self.subjects.read().await;
        let mut subjects_vec: Vec<&Subject> = subjects.values().collect();
        subjects_vec.sort_by_key(|s| s.id);

        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&subjects_vec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&self.storage_path, contents)?;
        Ok(())
    }

    /// Insert or replace a subject and persist the file.
    pub async fn upsert(&self, mut subject: Subject) -> Result<(), std::io::Error> {
        subject.updated_at = chrono::Utc::now();
        {
            let mut subjects = self.subjects.write().await;
            subjects.insert(subject.id, subject);
        }
        self.save_to_disk().await
    }
}

#[async_trait]
impl SubjectStore for JsonSubjectStore {
    async fn get(&self, id: i64) -> Result<Subject, SubjectError> {
        self.subjects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SubjectError::NotFound(id))
    }
}

pub type SharedSubjectStore = Arc<dyn SubjectStore>;
