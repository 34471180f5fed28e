use std::path::PathBuf;
use std::time::Duration;

use dex_storage::{BackoffPolicy, HttpClientConfig};
use tracing::warn;

use crate::validation::ValidationPolicy;

const DEFAULT_MIRROR: &str =
    "https://raw.githubusercontent.com/Kengxxiao/ArknightsGameData/5ba509ad5a07f17b7e220a25f1ff66794dd79af1/en_US/gamedata";
const DEFAULT_SECONDARY_MIRROR: &str =
    "https://raw.githubusercontent.com/Kengxxiao/ArknightsGameData/master/zh_CN/gamedata";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub mirrors: Vec<String>,
    pub secondary_mirrors: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_base_delay_ms: u64,
    pub fetch_concurrency: usize,
    pub commit: bool,
    pub schema_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub validation: ValidationPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            data_dir: PathBuf::from("./gamedata"),
            mirrors: vec![DEFAULT_MIRROR.to_string()],
            secondary_mirrors: vec![DEFAULT_SECONDARY_MIRROR.to_string()],
            user_agent: "dexsync/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_base_delay_ms: 5000,
            fetch_concurrency: 4,
            commit: false,
            schema_dir: PathBuf::from("./schemas"),
            reports_dir: PathBuf::from("./reports"),
            validation: ValidationPolicy::Advisory,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            data_dir: std::env::var("DEXSYNC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            mirrors: std::env::var("DEXSYNC_MIRRORS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.mirrors),
            secondary_mirrors: std::env::var("DEXSYNC_SECONDARY_MIRRORS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.secondary_mirrors),
            user_agent: std::env::var("DEXSYNC_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DEXSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            fetch_base_delay_ms: std::env::var("DEXSYNC_FETCH_BASE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_base_delay_ms),
            fetch_concurrency: std::env::var("DEXSYNC_FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.fetch_concurrency),
            commit: std::env::var("DEXSYNC_COMMIT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            schema_dir: std::env::var("DEXSYNC_SCHEMA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_dir),
            reports_dir: std::env::var("DEXSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            validation: match std::env::var("DEXSYNC_VALIDATION") {
                Ok(v) => v.parse().unwrap_or_else(|err: String| {
                    warn!(%err, "falling back to advisory validation");
                    ValidationPolicy::Advisory
                }),
                Err(_) => defaults.validation,
            },
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            ..BackoffPolicy::default()
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_lists_split_on_commas() {
        assert_eq!(
            split_list(" https://a/, ,https://b "),
            vec!["https://a/".to_string(), "https://b".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn defaults_are_a_dry_run_with_linear_backoff() {
        let config = SyncConfig::default();
        assert!(!config.commit);
        assert_eq!(config.fetch_concurrency, 4);
        let backoff = config.backoff();
        assert_eq!(backoff.max_attempts, 3);
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(10));
    }
}
