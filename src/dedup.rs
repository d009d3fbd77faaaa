//! Seen-URL bookkeeping.
//!
//! A [`SeenSet`] is the durable record of URLs already turned into records.
//! The [`Deduplicator`] gates the fetch stage: `should_fetch` atomically
//! claims a URL for the current run, so concurrent workers never fetch the
//! same URL twice, while `mark_seen` persists it only once a record was
//! emitted. URLs whose fetch failed are therefore retried on the next run.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Append-only set of processed URLs.
pub trait SeenSet: Send + Sync {
    fn exists(&self, url: &str) -> bool;

    /// Insert `url`, returning whether it was already present.
    fn insert(&self, url: &str) -> bool;
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySeenSet {
    urls: Mutex<HashSet<String>>,
}

#[cfg(test)]
impl MemorySeenSet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl SeenSet for MemorySeenSet {
    fn exists(&self, url: &str) -> bool {
        self.urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(url)
    }

    fn insert(&self, url: &str) -> bool {
        !self
            .urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string())
    }
}

/// Newline-delimited file of seen URLs, loaded once and appended on insert.
#[derive(Debug)]
pub struct FileSeenSet {
    path: PathBuf,
    state: Mutex<(HashSet<String>, File)>,
}

impl FileSeenSet {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut urls = HashSet::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                let line = line.trim();
                if !line.is_empty() {
                    urls.insert(line.to_string());
                }
            }
        }
        info!(path = %path.display(), count = urls.len(), "Loaded seen-URL set");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            state: Mutex::new((urls, file)),
        })
    }
}

impl SeenSet for FileSeenSet {
    fn exists(&self, url: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .contains(url)
    }

    fn insert(&self, url: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (urls, file) = &mut *state;
        if !urls.insert(url.to_string()) {
            return true;
        }
        if let Err(e) = writeln!(file, "{url}") {
            warn!(path = %self.path.display(), %url, error = %e, "Failed to persist seen URL");
        }
        false
    }
}

/// Fetch gate shared by all workers of one run.
pub struct Deduplicator {
    store: Arc<dyn SeenSet>,
    claimed: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SeenSet>) -> Self {
        Self {
            store,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// `true` exactly once per run for a URL not yet in the durable set.
    pub fn should_fetch(&self, url: &str) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if self.store.exists(url) {
            return false;
        }
        claimed.insert(url.to_string())
    }

    pub fn mark_seen(&self, url: &str) {
        self.store.insert(url);
    }
}
