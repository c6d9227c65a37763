//! Discovery of queue manifest files on disk.
//!
//! A manifest is a `*.queue.json` file describing one queue:
//!
//! ```json
//! { "name": "emails", "handler": "send_email", "attempts": 3,
//!   "backoff": { "strategy": "exponential", "delay": 1000, "cap": 60000 },
//!   "remove_on_complete": true }
//! ```
//!
//! Only `name` is required. Files that are empty or carry no name are
//! skipped without creating a queue.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use log::{debug, warn};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::backoff::BackoffOptions;
use crate::errors::{BullpenError, Result};
use crate::job::JobOptions;

/// File name suffix of queue manifests
pub const MANIFEST_SUFFIX: &str = ".queue.json";

/// Default directory searched for manifests
pub const DEFAULT_PATH: &str = "queues";

/// Where to look for manifests, relative to a root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOptions {
    /// Glob patterns matched against paths relative to the root
    Globs(Vec<String>),
    /// Every `<path>` directory below each prefix directory, at any depth
    Directory { path: String, prefix: Vec<String> },
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions::Directory {
            path: DEFAULT_PATH.to_string(),
            prefix: Vec::new(),
        }
    }
}

impl DiscoveryOptions {
    /// Glob patterns equivalent to these options
    pub fn patterns(&self) -> Vec<String> {
        match self {
            DiscoveryOptions::Globs(patterns) => patterns.clone(),
            DiscoveryOptions::Directory { path, prefix } => {
                let path = path.trim_matches('/');
                if prefix.is_empty() {
                    vec![format!("**/{}/**/*{}", path, MANIFEST_SUFFIX)]
                } else {
                    prefix
                        .iter()
                        .map(|p| format!("{}/**/{}/**/*{}", p.trim_matches('/'), path, MANIFEST_SUFFIX))
                        .collect()
                }
            }
        }
    }
}

/// A queue definition read from a manifest file
#[derive(Debug, Clone, PartialEq)]
pub struct QueueManifest {
    /// Queue name
    pub name: String,
    /// Catalog key of the handler; the queue name when unset
    pub handler: Option<String>,
    /// Job defaults for the queue
    pub defaults: JobOptions,
    /// File the manifest was read from
    pub source: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    handler: Option<String>,
    attempts: Option<u32>,
    delay: Option<u64>,
    backoff: Option<BackoffOptions>,
    remove_on_complete: Option<bool>,
    remove_on_fail: Option<bool>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| BullpenError::DiscoveryError(format!("invalid pattern {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| BullpenError::DiscoveryError(e.to_string()))
}

/// Find and parse every manifest below `root` matching `options`
pub fn discover(root: &Path, options: &DiscoveryOptions) -> Result<Vec<QueueManifest>> {
    if !root.is_dir() {
        return Err(BullpenError::DiscoveryError(format!(
            "search root {} is not a directory",
            root.display()
        )));
    }
    let globs = build_globset(&options.patterns())?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path during discovery: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = pathdiff::diff_paths(entry.path(), root) else {
            continue;
        };
        if globs.is_match(&relative) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let mut manifests = Vec::new();
    for file in files {
        if let Some(manifest) = load_manifest(&file) {
            manifests.push(manifest);
        }
    }
    debug!("Discovered {} queue manifest(s) under {}", manifests.len(), root.display());
    Ok(manifests)
}

/// Parse one manifest. Empty, nameless or unparsable files yield `None`.
pub fn load_manifest(path: &Path) -> Option<QueueManifest> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping manifest {}: {}", path.display(), e);
            return None;
        }
    };
    if content.trim().is_empty() {
        debug!("Skipping empty manifest {}", path.display());
        return None;
    }

    let raw: RawManifest = match serde_json::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Skipping invalid manifest {}: {}", path.display(), e);
            return None;
        }
    };
    let name = match raw.name {
        Some(name) if !name.trim().is_empty() => name,
        _ => {
            debug!("Skipping manifest without name {}", path.display());
            return None;
        }
    };

    Some(QueueManifest {
        name,
        handler: raw.handler,
        defaults: JobOptions {
            delay: raw.delay,
            run_at: None,
            attempts: raw.attempts,
            backoff: raw.backoff,
            remove_on_complete: raw.remove_on_complete,
            remove_on_fail: raw.remove_on_fail,
        },
        source: path.to_path_buf(),
    })
}
