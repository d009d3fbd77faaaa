//! JSON Lines output.
//!
//! Each accepted record becomes one line of
//! `{output_dir}/{YYYY-MM-DD}/{site}.jsonl`. The date is the crawl day, so
//! repeated runs on one day append to the same files.

use super::{OutputError, RecordSink};
use crate::models::ArticleRecord;
use crate::utils::slugify;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

/// Appends records to per-site files under one dated directory.
pub struct JsonLinesSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonLinesSink {
    #[instrument(level = "info", skip_all, fields(%date))]
    pub async fn create(output_dir: impl AsRef<Path>, date: NaiveDate) -> Result<Self, OutputError> {
        let dir = output_dir.as_ref().join(date.to_string());
        info!(dir = %dir.display(), "Ensuring JSON Lines directory exists");
        if let Err(e) = fs::create_dir_all(&dir).await {
            error!(dir = %dir.display(), error = %e, "Failed to create output dir");
            return Err(e.into());
        }
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, site: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", slugify(site)))
    }
}

impl RecordSink for JsonLinesSink {
    async fn emit(&self, record: ArticleRecord) -> Result<(), OutputError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut files = self.files.lock().await;
        if !files.contains_key(&record.site) {
            let path = self.path_for(&record.site);
            info!(path = %path.display(), "Opening JSON Lines file");
            let file = OpenOptions::new().create(true).append(true).open(&path).await?;
            files.insert(record.site.clone(), file);
        }
        if let Some(file) = files.get_mut(&record.site) {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        debug!(site = %record.site, url = %record.short_url, "Wrote record");
        Ok(())
    }
}
