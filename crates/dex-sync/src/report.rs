use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::validation::ValidationFailure;
use crate::SyncError;

pub const REPORT_FILE: &str = "sync_report.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: String,
    pub artifacts: usize,
    pub retries: u32,
    pub found: usize,
    pub prior: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub duplicates: Vec<String>,
    pub keyless: usize,
    pub validated: bool,
    pub validation: Option<ValidationFailure>,
    pub written: usize,
}

impl CategoryReport {
    pub fn changed(&self) -> usize {
        self.new + self.updated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub epoch: i64,
    pub revision: String,
    pub committed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategoryReport>,
    /// Set when the run stopped early; `categories` then holds only the ones that finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub category: Option<String>,
    pub error: String,
}

impl RunFailure {
    /// Flattens the error and its sources into one line.
    pub fn from_error(err: &SyncError) -> Self {
        let mut error = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            error.push_str(": ");
            error.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            category: err.category().map(str::to_string),
            error,
        }
    }
}

impl SyncReport {
    pub fn changed(&self) -> usize {
        self.categories.iter().map(CategoryReport::changed).sum()
    }

    pub fn written(&self) -> usize {
        self.categories.iter().map(|c| c.written).sum()
    }
}

/// Writes `<reports_root>/<epoch>/sync_report.json`, replacing any earlier report for that epoch.
pub async fn write_report(reports_root: &Path, report: &SyncReport) -> std::io::Result<PathBuf> {
    let dir = reports_root.join(report.epoch.to_string());
    fs::create_dir_all(&dir).await?;
    let path = dir.join(REPORT_FILE);
    let bytes = serde_json::to_vec_pretty(report)?;
    fs::write(&path, bytes).await?;
    Ok(path)
}
