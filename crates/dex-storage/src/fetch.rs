use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Result of a single attempt against one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Ok(Vec<u8>),
    NotFound,
    Transient(String),
    Permanent(String),
}

pub fn classify_status(status: StatusCode) -> AttemptOutcome {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        AttemptOutcome::NotFound
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptOutcome::Transient(format!("http status {}", status.as_u16()))
    } else {
        AttemptOutcome::Permanent(format!("http status {}", status.as_u16()))
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> AttemptOutcome {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AttemptOutcome::Transient(err.to_string())
    } else {
        AttemptOutcome::Permanent(err.to_string())
    }
}

/// Linear backoff: the pause after failed attempt `n` is `base_delay * n`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_number: usize) -> Duration {
        self.base_delay
            .saturating_mul(u32::try_from(attempt_number).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[async_trait]
pub trait MirrorTransport: Send + Sync {
    async fn get(&self, url: &str) -> AttemptOutcome;
}

#[derive(Debug)]
pub struct HttpMirror {
    client: reqwest::Client,
}

impl HttpMirror {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MirrorTransport for HttpMirror {
    async fn get(&self, url: &str) -> AttemptOutcome {
        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(err) => return classify_reqwest_error(&err),
        };
        let status = resp.status();
        if !status.is_success() {
            return classify_status(status);
        }
        match resp.bytes().await {
            Ok(body) => AttemptOutcome::Ok(body.to_vec()),
            Err(err) => classify_reqwest_error(&err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Local(PathBuf),
    Mirror(String),
}

impl fmt::Display for ArtifactOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Mirror(url) => f.write_str(url),
        }
    }
}

/// A parsed data table, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub path: String,
    pub origin: ArtifactOrigin,
    /// Backoff pauses taken before the successful attempt.
    pub retries: u32,
    pub value: Value,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("malformed payload for {path} from {origin}: {reason}")]
    Malformed {
        path: String,
        origin: String,
        reason: String,
    },
    #[error("unable to fetch {path}: {}", .attempts.join("; "))]
    Exhausted { path: String, attempts: Vec<String> },
}

impl FetchError {
    pub fn path(&self) -> &str {
        match self {
            Self::Malformed { path, .. } | Self::Exhausted { path, .. } => path,
        }
    }
}

/// Fetches artifacts from a preferred local root, falling back to mirrors in order.
#[derive(Clone)]
pub struct SourceFetcher {
    local_root: Option<PathBuf>,
    mirrors: Vec<String>,
    transport: Arc<dyn MirrorTransport>,
    backoff: BackoffPolicy,
}

impl fmt::Debug for SourceFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFetcher")
            .field("local_root", &self.local_root)
            .field("mirrors", &self.mirrors)
            .field("backoff", &self.backoff)
            .finish()
    }
}

struct AttemptLog {
    chain: Vec<String>,
    retries: u32,
}

impl SourceFetcher {
    pub fn new(
        local_root: Option<PathBuf>,
        mirrors: Vec<String>,
        transport: Arc<dyn MirrorTransport>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            local_root,
            mirrors,
            transport,
            backoff,
        }
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub async fn fetch(&self, path: &str) -> Result<RawArtifact, FetchError> {
        let span = info_span!("fetch_artifact", path);
        self.fetch_inner(path).instrument(span).await
    }

    async fn fetch_inner(&self, path: &str) -> Result<RawArtifact, FetchError> {
        let relative = path.trim_start_matches('/');
        let mut log = AttemptLog {
            chain: Vec::new(),
            retries: 0,
        };

        if let Some(root) = &self.local_root {
            if let Some(file_path) = local_path(root, relative) {
                let label = format!("local {}", file_path.display());
                let found = self
                    .attempt_source(&label, &mut log, || read_local(file_path.clone()))
                    .await;
                if let Some(bytes) = found {
                    return parse_artifact(relative, ArtifactOrigin::Local(file_path), log.retries, &bytes);
                }
            } else {
                log.chain.push(format!("local: rejected path {relative}"));
            }
        }

        for mirror in &self.mirrors {
            let url = format!("{}/{}", mirror.trim_end_matches('/'), relative);
            let found = self
                .attempt_source(&url, &mut log, || self.transport.get(&url))
                .await;
            if let Some(bytes) = found {
                return parse_artifact(relative, ArtifactOrigin::Mirror(url), log.retries, &bytes);
            }
        }

        Err(FetchError::Exhausted {
            path: relative.to_string(),
            attempts: log.chain,
        })
    }

    /// Runs up to `max_attempts` against one source. `None` means fall through.
    async fn attempt_source<F, Fut>(
        &self,
        label: &str,
        log: &mut AttemptLog,
        mut attempt: F,
    ) -> Option<Vec<u8>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        for attempt_number in 1..=max_attempts {
            match attempt().await {
                AttemptOutcome::Ok(bytes) => return Some(bytes),
                AttemptOutcome::NotFound => {
                    debug!(source = label, "artifact not found");
                    log.chain.push(format!("{label}: not found"));
                    return None;
                }
                AttemptOutcome::Permanent(reason) => {
                    log.chain.push(format!("{label}: {reason}"));
                    return None;
                }
                AttemptOutcome::Transient(reason) => {
                    log.chain
                        .push(format!("{label}: attempt {attempt_number}: {reason}"));
                    if attempt_number < max_attempts {
                        let delay = self.backoff.delay_for_attempt(attempt_number);
                        warn!(source = label, attempt_number, ?delay, %reason, "transient fetch failure, backing off");
                        tokio::time::sleep(delay).await;
                        log.retries += 1;
                    }
                }
            }
        }
        None
    }
}

fn local_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    let safe = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    safe.then(|| root.join(rel))
}

async fn read_local(path: PathBuf) -> AttemptOutcome {
    match tokio::fs::read(&path).await {
        Ok(bytes) => AttemptOutcome::Ok(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AttemptOutcome::NotFound,
        Err(err) => AttemptOutcome::Transient(err.to_string()),
    }
}

fn parse_artifact(
    path: &str,
    origin: ArtifactOrigin,
    retries: u32,
    bytes: &[u8],
) -> Result<RawArtifact, FetchError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => Ok(RawArtifact {
            path: path.to_string(),
            origin,
            retries,
            value,
        }),
        Err(err) => Err(FetchError::Malformed {
            path: path.to_string(),
            origin: origin.to_string(),
            reason: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn script(self, url: &str, outcomes: Vec<AttemptOutcome>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(url.to_string(), outcomes.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MirrorTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> AttemptOutcome {
            self.calls.lock().unwrap().push(url.to_string());
            self.scripts
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front())
                .unwrap_or(AttemptOutcome::NotFound)
        }
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    fn rate_limited() -> AttemptOutcome {
        AttemptOutcome::Transient("http status 429".into())
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn status_classification_separates_missing_from_transient() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), AttemptOutcome::NotFound);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            AttemptOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            AttemptOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            AttemptOutcome::Permanent(_)
        ));
    }

    #[tokio::test]
    async fn rate_limited_twice_then_succeeds() {
        let transport = Arc::new(ScriptedTransport::default().script(
            "https://mirror.test/excel/range_table.json",
            vec![rate_limited(), rate_limited(), AttemptOutcome::Ok(br#"{"r1":{}}"#.to_vec())],
        ));
        let fetcher = SourceFetcher::new(
            None,
            vec!["https://mirror.test/".into()],
            transport.clone(),
            quick_backoff(),
        );

        let artifact = fetcher.fetch("excel/range_table.json").await.unwrap();
        assert_eq!(artifact.retries, 2);
        assert_eq!(
            artifact.origin,
            ArtifactOrigin::Mirror("https://mirror.test/excel/range_table.json".into())
        );
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_carry_the_failure_chain() {
        let transport = Arc::new(ScriptedTransport::default().script(
            "https://a.test/t.json",
            vec![rate_limited(), rate_limited(), rate_limited()],
        ));
        let fetcher = SourceFetcher::new(None, vec!["https://a.test".into()], transport, quick_backoff());

        let err = fetcher.fetch("t.json").await.unwrap_err();
        match err {
            FetchError::Exhausted { path, attempts } => {
                assert_eq!(path, "t.json");
                assert_eq!(attempts.len(), 3);
                assert!(attempts[2].contains("attempt 3"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_miss_falls_through_to_mirrors_without_retrying() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default().script(
            "https://b.test/t.json",
            vec![AttemptOutcome::Ok(b"[1,2]".to_vec())],
        ));
        let fetcher = SourceFetcher::new(
            Some(dir.path().to_path_buf()),
            vec!["https://a.test".into(), "https://b.test".into()],
            transport.clone(),
            quick_backoff(),
        );

        let artifact = fetcher.fetch("t.json").await.unwrap();
        assert_eq!(artifact.value, serde_json::json!([1, 2]));
        assert_eq!(artifact.retries, 0);
        assert_eq!(transport.calls(), vec!["https://a.test/t.json", "https://b.test/t.json"]);
    }

    #[tokio::test]
    async fn local_file_is_preferred() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("excel")).unwrap();
        std::fs::write(dir.path().join("excel/skill_table.json"), br#"{"sk":1}"#).unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let fetcher = SourceFetcher::new(
            Some(dir.path().to_path_buf()),
            vec!["https://a.test".into()],
            transport.clone(),
            quick_backoff(),
        );

        let artifact = fetcher.fetch("excel/skill_table.json").await.unwrap();
        assert!(matches!(artifact.origin, ArtifactOrigin::Local(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_is_permanent() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let fetcher = SourceFetcher::new(
            Some(dir.path().to_path_buf()),
            vec!["https://a.test".into()],
            transport.clone(),
            quick_backoff(),
        );

        let err = fetcher.fetch("bad.json").await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn parent_components_are_rejected_locally() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let fetcher = SourceFetcher::new(Some(dir.path().to_path_buf()), vec![], transport, quick_backoff());
        let err = fetcher.fetch("../secret.json").await.unwrap_err();
        assert_eq!(err.path(), "../secret.json");
    }
}
