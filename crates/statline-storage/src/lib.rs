//! Unit artifact storage + HTTP fetch utilities for statline.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use statline_core::{canonicalize, Payload, Unit, UnitEnvelope, UnitKey, UnitMeta, UnitStatus};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statline-storage";

const DIAGNOSTICS_DIR: &str = "_diagnostics";

/// What to do when a source has nothing for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyPolicy {
    #[default]
    Skip,
    Placeholder,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub empty_policy: EmptyPolicy,
    pub force_refresh: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    Created,
    Updated,
    Unchanged,
    Placeholder,
    SkippedEmpty,
}

impl StoreOutcome {
    /// True when the outcome put new bytes on disk (or would have, in a dry run).
    pub fn is_change(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Placeholder)
    }
}

#[derive(Debug, Clone)]
pub struct StoredUnit {
    pub outcome: StoreOutcome,
    pub path: PathBuf,
    pub fingerprint: Option<String>,
}

/// Storage scope of one dataset period, e.g. `cfb-box-scores` / 2025.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactScope {
    pub dataset_id: String,
    pub period: i32,
}

impl ArtifactScope {
    pub fn new(dataset_id: impl Into<String>, period: i32) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            period,
        }
    }
}

#[derive(Debug, Clone)]
struct ExistingArtifact {
    fingerprint: String,
    status: UnitStatus,
}

#[derive(Debug, Clone)]
pub struct UnitStore {
    root: PathBuf,
    options: StoreOptions,
}

impl UnitStore {
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// SHA-256 of the canonical (key-sorted) JSON form of `payload`.
    pub fn fingerprint(payload: &Payload) -> String {
        let canonical = canonicalize(payload);
        Self::sha256_hex(canonical.to_string().as_bytes())
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id)
    }

    pub fn period_dir(&self, scope: &ArtifactScope) -> PathBuf {
        self.dataset_dir(&scope.dataset_id)
            .join(scope.period.to_string())
    }

    pub fn artifact_path(&self, scope: &ArtifactScope, key: &UnitKey) -> PathBuf {
        self.period_dir(scope)
            .join(format!("{}.json", key.file_stem()))
    }

    /// Persist one unit, skipping the write when the stored payload already matches.
    pub async fn store_unit(
        &self,
        scope: &ArtifactScope,
        unit: &Unit,
        run_id: Uuid,
    ) -> anyhow::Result<StoredUnit> {
        let path = self.artifact_path(scope, &unit.key);
        let existing = read_existing(&path).await?;

        let payload = unit.payload.as_ref().filter(|_| unit.has_data());
        let Some(payload) = payload else {
            return self.store_empty(unit, run_id, path, existing).await;
        };

        let fingerprint = Self::fingerprint(payload);
        let outcome = match &existing {
            None => StoreOutcome::Created,
            Some(prev) if prev.fingerprint == fingerprint && !self.options.force_refresh => {
                StoreOutcome::Unchanged
            }
            Some(_) => StoreOutcome::Updated,
        };

        if outcome != StoreOutcome::Unchanged && !self.options.dry_run {
            let envelope = UnitEnvelope {
                meta: UnitMeta {
                    unit: unit.key,
                    run_id,
                    fetched_at: unit.fetched_at,
                    status: UnitStatus::Data,
                    fingerprint: fingerprint.clone(),
                    provenance: unit.provenance.clone(),
                    note: None,
                },
                data: payload.clone(),
            };
            write_envelope(&path, &envelope).await?;
        }

        Ok(StoredUnit {
            outcome,
            path,
            fingerprint: Some(fingerprint),
        })
    }

    async fn store_empty(
        &self,
        unit: &Unit,
        run_id: Uuid,
        path: PathBuf,
        existing: Option<ExistingArtifact>,
    ) -> anyhow::Result<StoredUnit> {
        if self.options.empty_policy == EmptyPolicy::Skip {
            return Ok(StoredUnit {
                outcome: StoreOutcome::SkippedEmpty,
                path,
                fingerprint: None,
            });
        }

        if let Some(prev) = existing {
            if prev.status == UnitStatus::Data {
                warn!(
                    unit = %unit.key,
                    path = %path.display(),
                    "source returned no data; keeping the stored artifact"
                );
            }
            return Ok(StoredUnit {
                outcome: StoreOutcome::Unchanged,
                path,
                fingerprint: Some(prev.fingerprint),
            });
        }

        let fingerprint = Self::fingerprint(&Value::Null);
        if !self.options.dry_run {
            let envelope = UnitEnvelope {
                meta: UnitMeta {
                    unit: unit.key,
                    run_id,
                    fetched_at: unit.fetched_at,
                    status: UnitStatus::NoData,
                    fingerprint: fingerprint.clone(),
                    provenance: unit.provenance.clone(),
                    note: Some("no data returned from any tried endpoint".to_string()),
                },
                data: Value::Null,
            };
            write_envelope(&path, &envelope).await?;
        }

        Ok(StoredUnit {
            outcome: StoreOutcome::Placeholder,
            path,
            fingerprint: Some(fingerprint),
        })
    }

    /// Unit artifacts of a period in lexical (= unit) order.
    pub async fn list_artifacts(&self, scope: &ArtifactScope) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.period_dir(scope);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking period directory {}", dir.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading period directory {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && !name.starts_with('.') && name.ends_with(".json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Keep an unparseable response body next to the period's artifacts for manual inspection.
    pub async fn save_diagnostic(
        &self,
        scope: &ArtifactScope,
        key: &UnitKey,
        body: &[u8],
    ) -> anyhow::Result<Option<PathBuf>> {
        if self.options.dry_run {
            return Ok(None);
        }
        let path = self
            .period_dir(scope)
            .join(DIAGNOSTICS_DIR)
            .join(format!("{}.body", key.file_stem()));
        write_atomic(&path, body).await?;
        Ok(Some(path))
    }
}

async fn read_existing(path: &Path) -> anyhow::Result<Option<ExistingArtifact>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading artifact {}", path.display()))
        }
    };

    if let Ok(envelope) = serde_json::from_slice::<UnitEnvelope>(&bytes) {
        return Ok(Some(ExistingArtifact {
            fingerprint: UnitStore::fingerprint(&envelope.data),
            status: envelope.meta.status,
        }));
    }

    // Bare JSON from older runs, or a corrupt file that will simply be replaced.
    let fingerprint = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => UnitStore::fingerprint(&value),
        Err(_) => String::new(),
    };
    Ok(Some(ExistingArtifact {
        fingerprint,
        status: UnitStatus::Data,
    }))
}

async fn write_envelope(path: &Path, envelope: &UnitEnvelope) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(envelope)
        .with_context(|| format!("serializing artifact {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// Replace `path` wholesale via a temp file in the same directory and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = write_then_rename(&temp_path, path, bytes).await;
    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    fs::rename(temp_path, path).await.with_context(|| {
        format!(
            "atomically renaming {} -> {}",
            temp_path.display(),
            path.display()
        )
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Multiplicative backoff: retry `n` waits `base_delay * factor^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1500),
            factor: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub politeness_delay: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            politeness_delay: Duration::from_millis(250),
        }
    }
}

/// Fixed spacing between the starts of consecutive requests.
#[derive(Debug)]
pub struct PolitenessGate {
    spacing: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl PolitenessGate {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.spacing {
                tokio::time::sleep(self.spacing - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    gate: PolitenessGate,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchedJson {
    pub status: StatusCode,
    pub final_url: String,
    pub value: Value,
    pub attempts: usize,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {message}")]
    Decode {
        url: String,
        message: String,
        truncated: bool,
        body: Vec<u8>,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Decode { truncated, .. } => {
                if *truncated {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::NonRetryable
                }
            }
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            gate: PolitenessGate::new(config.politeness_delay),
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// GET `url` and decode a JSON body, retrying transient failures and truncated bodies.
    pub async fn fetch_json(
        &self,
        source_id: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<FetchedJson, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async move {
            let max_attempts = self.backoff.max_attempts.max(1);
            let mut attempt = 0usize;
            loop {
                attempt += 1;
                let result = match self.send_once(url, bearer).await {
                    Ok(response) => decode_json(response, attempt),
                    Err(err) => Err(err),
                };
                let err = match result {
                    Ok(fetched) => return Ok(fetched),
                    Err(err) => err,
                };

                if err.disposition() == RetryDisposition::Retryable && attempt < max_attempts {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, max_attempts, ?delay, error = %err, "fetch attempt failed; retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, url: &str, bearer: Option<&str>) -> Result<FetchedResponse, FetchError> {
        self.gate.wait().await;

        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Request {
                url: final_url.clone(),
                source,
            })?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn decode_json(response: FetchedResponse, attempts: usize) -> Result<FetchedJson, FetchError> {
    let fetched_at = Utc::now();
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(FetchedJson {
            status: response.status,
            final_url: response.final_url,
            value: Value::Null,
            attempts,
            fetched_at,
        });
    }

    match serde_json::from_slice::<Value>(&response.body) {
        Ok(value) => Ok(FetchedJson {
            status: response.status,
            final_url: response.final_url,
            value,
            attempts,
            fetched_at,
        }),
        Err(err) => Err(FetchError::Decode {
            url: response.final_url,
            message: err.to_string(),
            truncated: err.is_eof(),
            body: response.body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statline_core::Provenance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-09-07T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn week_unit(week: u32, payload: Option<Value>) -> Unit {
        Unit {
            key: UnitKey::week(2025, week),
            payload,
            fetched_at: fetched_at(),
            provenance: Provenance {
                source_id: "cfbd".to_string(),
                endpoint: Some("advanced".to_string()),
                source_url: Some("https://example.test/games".to_string()),
                attempted: vec!["advanced".to_string()],
            },
        }
    }

    fn scope() -> ArtifactScope {
        ArtifactScope::new("cfb-box-scores", 2025)
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = UnitStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn fingerprint_ignores_field_order() {
        let a = json!({"games": [{"id": 1, "home": "A", "away": "B"}]});
        let b = json!({"games": [{"away": "B", "id": 1, "home": "A"}]});
        let c = json!({"games": [{"away": "B", "id": 2, "home": "A"}]});
        assert_eq!(UnitStore::fingerprint(&a), UnitStore::fingerprint(&b));
        assert_ne!(UnitStore::fingerprint(&a), UnitStore::fingerprint(&c));
    }

    #[tokio::test]
    async fn second_store_of_same_payload_is_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(dir.path(), StoreOptions::default());
        let unit = week_unit(3, Some(json!({"games": [{"id": 1}]})));

        let first = store.store_unit(&scope(), &unit, Uuid::new_v4()).await.expect("first");
        let modified = std::fs::metadata(&first.path).unwrap().modified().unwrap();
        let second = store.store_unit(&scope(), &unit, Uuid::new_v4()).await.expect("second");

        assert_eq!(first.outcome, StoreOutcome::Created);
        assert_eq!(second.outcome, StoreOutcome::Unchanged);
        assert_eq!(first.path, dir.path().join("cfb-box-scores/2025/week_03.json"));
        assert_eq!(
            std::fs::metadata(&second.path).unwrap().modified().unwrap(),
            modified
        );
    }

    #[tokio::test]
    async fn changed_payload_is_rewritten_and_force_refresh_rewrites() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(dir.path(), StoreOptions::default());
        let run_id = Uuid::new_v4();

        store
            .store_unit(&scope(), &week_unit(3, Some(json!([{"id": 1, "pts": 7}]))), run_id)
            .await
            .expect("create");
        let changed = store
            .store_unit(&scope(), &week_unit(3, Some(json!([{"id": 1, "pts": 10}]))), run_id)
            .await
            .expect("update");
        assert_eq!(changed.outcome, StoreOutcome::Updated);

        let text = std::fs::read_to_string(&changed.path).unwrap();
        let envelope: UnitEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.data, json!([{"id": 1, "pts": 10}]));
        assert_eq!(envelope.meta.status, UnitStatus::Data);
        assert_eq!(envelope.meta.provenance.endpoint.as_deref(), Some("advanced"));

        let forced = UnitStore::new(
            dir.path(),
            StoreOptions {
                force_refresh: true,
                ..Default::default()
            },
        );
        let again = forced
            .store_unit(&scope(), &week_unit(3, Some(json!([{"id": 1, "pts": 10}]))), run_id)
            .await
            .expect("forced");
        assert_eq!(again.outcome, StoreOutcome::Updated);
    }

    #[tokio::test]
    async fn empty_payload_follows_policy() {
        let dir = tempdir().expect("tempdir");
        let skip = UnitStore::new(dir.path(), StoreOptions::default());
        let skipped = skip
            .store_unit(&scope(), &week_unit(9, Some(json!([]))), Uuid::new_v4())
            .await
            .expect("skip");
        assert_eq!(skipped.outcome, StoreOutcome::SkippedEmpty);
        assert!(!skipped.path.exists());

        let placeholder = UnitStore::new(
            dir.path(),
            StoreOptions {
                empty_policy: EmptyPolicy::Placeholder,
                ..Default::default()
            },
        );
        let first = placeholder
            .store_unit(&scope(), &week_unit(9, None), Uuid::new_v4())
            .await
            .expect("placeholder");
        assert_eq!(first.outcome, StoreOutcome::Placeholder);
        let envelope: UnitEnvelope =
            serde_json::from_slice(&std::fs::read(&first.path).unwrap()).unwrap();
        assert_eq!(envelope.meta.status, UnitStatus::NoData);
        assert_eq!(envelope.data, Value::Null);

        let second = placeholder
            .store_unit(&scope(), &week_unit(9, None), Uuid::new_v4())
            .await
            .expect("placeholder again");
        assert_eq!(second.outcome, StoreOutcome::Unchanged);
    }

    #[tokio::test]
    async fn placeholder_never_replaces_real_data() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(
            dir.path(),
            StoreOptions {
                empty_policy: EmptyPolicy::Placeholder,
                force_refresh: true,
                ..Default::default()
            },
        );
        let stored = store
            .store_unit(&scope(), &week_unit(2, Some(json!([{"id": 5}]))), Uuid::new_v4())
            .await
            .expect("data");
        let empty = store
            .store_unit(&scope(), &week_unit(2, None), Uuid::new_v4())
            .await
            .expect("empty");
        assert_eq!(empty.outcome, StoreOutcome::Unchanged);
        let envelope: UnitEnvelope =
            serde_json::from_slice(&std::fs::read(&stored.path).unwrap()).unwrap();
        assert_eq!(envelope.data, json!([{"id": 5}]));
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(
            dir.path(),
            StoreOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let stored = store
            .store_unit(&scope(), &week_unit(1, Some(json!({"id": 1}))), Uuid::new_v4())
            .await
            .expect("dry run");
        assert_eq!(stored.outcome, StoreOutcome::Created);
        assert!(!stored.path.exists());
    }

    #[tokio::test]
    async fn bare_json_artifacts_compare_by_content() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(dir.path(), StoreOptions::default());
        let path = store.artifact_path(&scope(), &UnitKey::week(2025, 4));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"[{"team": "A", "elo": 1500}]"#).unwrap();

        let stored = store
            .store_unit(
                &scope(),
                &week_unit(4, Some(json!([{"elo": 1500, "team": "A"}]))),
                Uuid::new_v4(),
            )
            .await
            .expect("legacy");
        assert_eq!(stored.outcome, StoreOutcome::Unchanged);
    }

    #[tokio::test]
    async fn listing_is_sorted_and_skips_temp_and_diagnostics() {
        let dir = tempdir().expect("tempdir");
        let store = UnitStore::new(dir.path(), StoreOptions::default());
        for week in [10, 2, 1] {
            store
                .store_unit(&scope(), &week_unit(week, Some(json!([{"w": week}]))), Uuid::new_v4())
                .await
                .expect("store");
        }
        let period = store.period_dir(&scope());
        std::fs::write(period.join(".abc.12.tmp"), b"partial").unwrap();
        store
            .save_diagnostic(&scope(), &UnitKey::week(2025, 5), b"<html>oops</html>")
            .await
            .expect("diagnostic");

        let names: Vec<_> = store
            .list_artifacts(&scope())
            .await
            .expect("list")
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["week_01.json", "week_02.json", "week_10.json"]);
        assert!(period.join("_diagnostics/week_05.body").exists());

        let missing = store
            .list_artifacts(&ArtifactScope::new("cfb-box-scores", 1999))
            .await
            .expect("missing period");
        assert!(missing.is_empty());
    }

    #[test]
    fn backoff_is_multiplicative_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            factor: 1.5,
            max_delay: Duration::from_millis(2500),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2250));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(2500));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    /// Serves one canned response per connection, in order.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/games"), hits)
    }

    fn fast_fetcher(max_attempts: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("statline-test".to_string()),
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(5),
                factor: 1.5,
                max_delay: Duration::from_millis(20),
            },
            politeness_delay: Duration::ZERO,
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (url, hits) = serve(vec![(503, ""), (500, ""), (200, r#"[{"id": 1}]"#)]).await;
        let fetched = fast_fetcher(4)
            .fetch_json("cfbd", &url, Some("token"))
            .await
            .expect("fetch");
        assert_eq!(fetched.value, json!([{"id": 1}]));
        assert_eq!(fetched.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (url, hits) = serve(vec![(404, ""), (200, "[]")]).await;
        let err = fast_fetcher(4)
            .fetch_json("cfbd", &url, None)
            .await
            .expect_err("404");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let (url, hits) = serve(vec![(429, ""), (502, ""), (503, ""), (200, "[]")]).await;
        let err = fast_fetcher(3)
            .fetch_json("cfbd", &url, None)
            .await
            .expect_err("exhausted");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn truncated_json_is_retried_but_garbage_is_not() {
        let (url, hits) = serve(vec![(200, r#"{"games": [1, 2"#), (200, r#"{"games": [1, 2]}"#)]).await;
        let fetched = fast_fetcher(4)
            .fetch_json("cfbd", &url, None)
            .await
            .expect("second attempt");
        assert_eq!(fetched.value, json!({"games": [1, 2]}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let (url, hits) = serve(vec![(200, "<html>maintenance</html>"), (200, "[]")]).await;
        let err = fast_fetcher(4)
            .fetch_json("cfbd", &url, None)
            .await
            .expect_err("garbage");
        match err {
            FetchError::Decode { truncated, body, .. } => {
                assert!(!truncated);
                assert_eq!(body, b"<html>maintenance</html>".to_vec());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn politeness_gate_spaces_requests() {
        let gate = PolitenessGate::new(Duration::from_millis(40));
        let started = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
