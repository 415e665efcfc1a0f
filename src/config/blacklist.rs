//! Hot-reloaded market blacklist.
//!
//! The blacklist is the only configuration input that may change while a
//! worker runs. The file is re-read when its modification time changes; a
//! file that fails to parse leaves the last good list in place.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{info, warn};

/// Parsed blacklist file.
///
/// ```json
/// { "markets": ["0xabc..."], "keywords": ["election"] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blacklist {
    #[serde(default)]
    pub markets: HashSet<String>,
    /// Lowercased substrings matched against market questions
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Blacklist {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        let mut list: Blacklist = serde_json::from_str(content)?;
        list.keywords = list
            .keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Ok(list)
    }

    /// Whether a market is blacklisted by id or question keyword.
    pub fn blocks(&self, market_id: &str, question: &str) -> bool {
        if self.markets.contains(market_id) {
            return true;
        }
        let question = question.to_lowercase();
        self.keywords.iter().any(|k| question.contains(k.as_str()))
    }

    pub fn len(&self) -> usize {
        self.markets.len() + self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watches a blacklist file and swaps in new contents when it changes.
pub struct BlacklistWatcher {
    path: Option<PathBuf>,
    current: RwLock<Arc<Blacklist>>,
    last_modified: RwLock<Option<SystemTime>>,
}

impl BlacklistWatcher {
    pub fn new(path: Option<PathBuf>) -> Self {
        let watcher = Self {
            path,
            current: RwLock::new(Arc::new(Blacklist::default())),
            last_modified: RwLock::new(None),
        };
        watcher.refresh();
        watcher
    }

    /// Snapshot of the active blacklist.
    pub fn current(&self) -> Arc<Blacklist> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Reload the file if it changed since the last successful read.
    ///
    /// Returns true when a new list was installed.
    pub fn refresh(&self) -> bool {
        let Some(path) = self.path.as_deref() else {
            return false;
        };

        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Blacklist file unavailable, keeping current list");
                return false;
            }
        };

        if self.last_seen() == Some(modified) {
            return false;
        }

        match load_file(path) {
            Ok(list) => {
                info!(path = %path.display(), entries = list.len(), "🚫 [BLACKLIST] Loaded blacklist");
                self.install(list, modified);
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse blacklist file, keeping last good list");
                // Remember the broken mtime so the warning is not repeated every cycle.
                if let Ok(mut last) = self.last_modified.write() {
                    *last = Some(modified);
                }
                false
            }
        }
    }

    fn last_seen(&self) -> Option<SystemTime> {
        self.last_modified.read().ok().and_then(|g| *g)
    }

    fn install(&self, list: Blacklist, modified: SystemTime) {
        if let Ok(mut current) = self.current.write() {
            *current = Arc::new(list);
        }
        if let Ok(mut last) = self.last_modified.write() {
            *last = Some(modified);
        }
    }
}

fn load_file(path: &Path) -> anyhow::Result<Blacklist> {
    let content = fs::read_to_string(path)?;
    Ok(Blacklist::parse(&content)?)
}
