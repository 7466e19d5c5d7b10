//! Policy Store
//!
//! Loads the declarative admission rules from a JSON document. A document
//! that cannot be read or validated is an error, never an empty or
//! permissive policy.

use crate::config::PolicyReload;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// Policy load errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Document unreadable
    #[error("error reading policy {path}: {source}")]
    Read {
        /// Document location
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// Not valid JSON or missing required fields
    #[error("error parsing policy: {0}")]
    Parse(#[from] serde_json::Error),
    /// Rule that fails validation
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Per-extension rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    /// Descriptor the content sniffer output must contain
    pub expected_content_descriptor: String,
    /// At least one must appear in the extracted strings
    pub allowed_substrings: Vec<String>,
    /// Extension-specific keywords for the hidden-content stage
    pub forbidden_contained_names: HashSet<String>,
}

/// Validated, immutable rule set
#[derive(Debug, Clone, Default)]
pub struct Policy {
    rules: HashMap<String, RuleEntry>,
    forbidden_keywords: HashSet<String>,
}

impl Policy {
    /// Parse and validate a policy document
    pub fn from_json(content: &str) -> Result<Self, PolicyError> {
        let document: PolicyDocument = serde_json::from_str(content)?;
        Self::from_document(document)
    }

    fn from_document(document: PolicyDocument) -> Result<Self, PolicyError> {
        let mut rules = HashMap::with_capacity(document.allowed_files.len());

        for file_type in document.allowed_files {
            let extension = normalize_extension(&file_type.extension)?;

            if file_type.description.trim().is_empty() {
                return Err(PolicyError::Invalid(format!(
                    "empty description for {}",
                    extension
                )));
            }
            if file_type.strings.iter().any(|s| s.trim().is_empty()) {
                return Err(PolicyError::Invalid(format!(
                    "empty allowed string for {}",
                    extension
                )));
            }

            let entry = RuleEntry {
                expected_content_descriptor: file_type.description,
                allowed_substrings: file_type.strings,
                forbidden_contained_names: non_empty_set(
                    file_type.forbidden_contained_names,
                    "forbidden contained name",
                )?,
            };

            if rules.insert(extension.clone(), entry).is_some() {
                return Err(PolicyError::Invalid(format!(
                    "duplicate extension {}",
                    extension
                )));
            }
        }

        Ok(Self {
            rules,
            forbidden_keywords: non_empty_set(document.forbidden_keywords, "forbidden keyword")?,
        })
    }

    /// Rule for an extension. Unknown extensions are denied by absence.
    pub fn rule(&self, extension: &str) -> Option<&RuleEntry> {
        self.rules.get(&extension.trim().to_lowercase())
    }

    /// Global forbidden keywords
    pub fn forbidden_keywords(&self) -> &HashSet<String> {
        &self.forbidden_keywords
    }

    /// Allowed extensions, sorted
    pub fn extensions(&self) -> Vec<&str> {
        let mut extensions: Vec<_> = self.rules.keys().map(String::as_str).collect();
        extensions.sort_unstable();
        extensions
    }
}

/// On-disk policy document
#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(alias = "rules")]
    allowed_files: Vec<FileTypeRule>,
    #[serde(alias = "forbiddenKeywords")]
    forbidden_keywords: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FileTypeRule {
    extension: String,
    #[serde(alias = "expectedContentDescriptor")]
    description: String,
    #[serde(alias = "allowedSubstrings")]
    strings: Vec<String>,
    #[serde(default, alias = "forbiddenContainedNames")]
    forbidden_contained_names: Vec<String>,
}

fn normalize_extension(raw: &str) -> Result<String, PolicyError> {
    let ext = raw.trim().to_lowercase();
    let ext = if ext.starts_with('.') { ext } else { format!(".{}", ext) };
    if ext.len() < 2 {
        return Err(PolicyError::Invalid(format!("invalid extension {:?}", raw)));
    }
    Ok(ext)
}

fn non_empty_set(values: Vec<String>, what: &str) -> Result<HashSet<String>, PolicyError> {
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(PolicyError::Invalid(format!("empty {}", what)));
    }
    Ok(values.into_iter().collect())
}

struct CachedPolicy {
    policy: Arc<Policy>,
    modified: Option<SystemTime>,
    len: u64,
}

/// Policy store backed by a document on disk
pub struct PolicyStore {
    /// Document location
    path: PathBuf,
    reload: PolicyReload,
    cache: RwLock<Option<CachedPolicy>>,
}

impl PolicyStore {
    /// Create a store for the document at `path`
    pub fn new(path: impl Into<PathBuf>, reload: PolicyReload) -> Self {
        Self {
            path: path.into(),
            reload,
            cache: RwLock::new(None),
        }
    }

    /// Load the current policy.
    ///
    /// The returned policy is shared read-only with the caller for the
    /// duration of one admission run.
    pub fn load(&self) -> Result<Arc<Policy>, PolicyError> {
        match self.reload {
            PolicyReload::EveryRequest => Ok(Arc::new(self.read_policy()?)),
            PolicyReload::OnChange => self.load_cached(),
        }
    }

    /// Drop any cached policy; the next load rereads the document
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    /// Document location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_cached(&self) -> Result<Arc<Policy>, PolicyError> {
        let metadata = std::fs::metadata(&self.path).map_err(|source| {
            self.invalidate();
            PolicyError::Read { path: self.path.clone(), source }
        })?;
        let modified = metadata.modified().ok();
        let len = metadata.len();

        if let Some(cached) = self.cache.read().as_ref() {
            if modified.is_some() && cached.modified == modified && cached.len == len {
                return Ok(cached.policy.clone());
            }
        }

        let policy = match self.read_policy() {
            Ok(policy) => Arc::new(policy),
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };

        tracing::info!(path = %self.path.display(), "Policy reloaded");
        *self.cache.write() = Some(CachedPolicy {
            policy: policy.clone(),
            modified,
            len,
        });
        Ok(policy)
    }

    fn read_policy(&self) -> Result<Policy, PolicyError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| PolicyError::Read {
            path: self.path.clone(),
            source,
        })?;
        Policy::from_json(&content)
    }
}
