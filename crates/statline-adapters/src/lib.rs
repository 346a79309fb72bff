//! Source adapter contracts + endpoint-cascade and fixture adapters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statline_core::{
    render_template, template_placeholders, ConfigError, Payload, Provenance, UnitKey, UnitKind,
};
use statline_storage::{FetchError, HttpFetcher, RetryDisposition};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statline-adapters";

const WEEK_VARS: [&str; 3] = ["year", "week", "season_type"];
const DATE_VARS: [&str; 4] = ["year", "date", "date_compact", "season_type"];

/// Per-batch values an adapter may need to address a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub period: i32,
    pub season_type: String,
    pub credential: Option<String>,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedUnit {
    pub payload: Payload,
    pub provenance: Provenance,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("no data from {attempted:?}")]
    NoData { attempted: Vec<String> },
    #[error("unparseable response from {url}: {message}")]
    Parse {
        url: String,
        message: String,
        body: Vec<u8>,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        key: &UnitKey,
    ) -> Result<FetchedUnit, AdapterError>;
}

/// One candidate endpoint of a cascade. `url` is a `{placeholder}` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTemplate {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Http { endpoints: Vec<EndpointTemplate> },
    Fixtures { dir: PathBuf },
}

/// Check endpoint templates against the placeholders a unit kind can fill.
pub fn validate_spec(
    spec: &AdapterSpec,
    kind: UnitKind,
    params: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    let AdapterSpec::Http { endpoints } = spec else {
        return Ok(());
    };
    if endpoints.is_empty() {
        return Err(ConfigError::Invalid(
            "http adapter needs at least one endpoint".to_string(),
        ));
    }

    let builtin: &[&str] = match kind {
        UnitKind::Week => &WEEK_VARS,
        UnitKind::Date => &DATE_VARS,
    };
    let allowed: BTreeSet<&str> = builtin
        .iter()
        .copied()
        .chain(params.keys().map(String::as_str))
        .collect();

    for endpoint in endpoints {
        for name in template_placeholders(&endpoint.url)? {
            if !allowed.contains(name) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} uses unknown placeholder {{{name}}}",
                    endpoint.name
                )));
            }
        }
    }
    Ok(())
}

pub fn template_vars(ctx: &AdapterContext, key: &UnitKey) -> BTreeMap<String, String> {
    let mut vars = ctx.params.clone();
    vars.insert("season_type".to_string(), ctx.season_type.clone());
    match key {
        UnitKey::Week { year, week } => {
            vars.insert("year".to_string(), year.to_string());
            vars.insert("week".to_string(), week.to_string());
        }
        UnitKey::Date { date } => {
            vars.insert("year".to_string(), ctx.period.to_string());
            vars.insert("date".to_string(), date.format("%Y-%m-%d").to_string());
            vars.insert("date_compact".to_string(), date.format("%Y%m%d").to_string());
        }
    }
    vars
}

pub fn adapter_from_spec(
    source_id: &str,
    spec: &AdapterSpec,
    workspace_root: &Path,
) -> Box<dyn SourceAdapter> {
    match spec {
        AdapterSpec::Http { endpoints } => Box::new(EndpointCascadeAdapter::new(
            source_id,
            endpoints.clone(),
        )),
        AdapterSpec::Fixtures { dir } => {
            Box::new(FixtureDirAdapter::new(source_id, workspace_root.join(dir)))
        }
    }
}

/// Tries each endpoint in order and takes the first parseable success.
#[derive(Debug, Clone)]
pub struct EndpointCascadeAdapter {
    source_id: String,
    endpoints: Vec<EndpointTemplate>,
}

impl EndpointCascadeAdapter {
    pub fn new(source_id: impl Into<String>, endpoints: Vec<EndpointTemplate>) -> Self {
        Self {
            source_id: source_id.into(),
            endpoints,
        }
    }
}

#[async_trait]
impl SourceAdapter for EndpointCascadeAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_unit(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        key: &UnitKey,
    ) -> Result<FetchedUnit, AdapterError> {
        let vars = template_vars(ctx, key);
        let mut attempted = Vec::new();
        let mut transient: Option<String> = None;
        let mut unparseable: Option<AdapterError> = None;

        for endpoint in &self.endpoints {
            let url = render_template(&endpoint.url, &vars)?;
            attempted.push(endpoint.name.clone());

            let err = match http
                .fetch_json(&self.source_id, &url, ctx.credential.as_deref())
                .await
            {
                Ok(fetched) => {
                    info!(unit = %key, endpoint = %endpoint.name, attempts = fetched.attempts, "endpoint answered");
                    return Ok(FetchedUnit {
                        payload: fetched.value,
                        provenance: Provenance {
                            source_id: self.source_id.clone(),
                            endpoint: Some(endpoint.name.clone()),
                            source_url: Some(fetched.final_url),
                            attempted,
                        },
                        fetched_at: fetched.fetched_at,
                    });
                }
                Err(err) => err,
            };

            let disposition = err.disposition();
            match err {
                FetchError::HttpStatus { status, .. }
                    if disposition == RetryDisposition::NonRetryable =>
                {
                    info!(unit = %key, endpoint = %endpoint.name, status, "endpoint has no data");
                }
                FetchError::Decode {
                    url, message, body, ..
                } => {
                    warn!(unit = %key, endpoint = %endpoint.name, %message, "endpoint returned unparseable body");
                    unparseable = Some(AdapterError::Parse { url, message, body });
                }
                other => {
                    warn!(unit = %key, endpoint = %endpoint.name, error = %other, "endpoint failed");
                    transient = Some(format!("{}: {other}", endpoint.name));
                }
            }
        }

        if let Some(reason) = transient {
            return Err(AdapterError::Transient(reason));
        }
        if let Some(err) = unparseable {
            return Err(err);
        }
        Err(AdapterError::NoData { attempted })
    }
}

/// Serves unit payloads from `<dir>/<period>/<stem>.json`, for offline replays.
#[derive(Debug, Clone)]
pub struct FixtureDirAdapter {
    source_id: String,
    dir: PathBuf,
}

impl FixtureDirAdapter {
    pub fn new(source_id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            dir: dir.into(),
        }
    }

    pub fn path_for(&self, period: i32, key: &UnitKey) -> PathBuf {
        self.dir
            .join(period.to_string())
            .join(format!("{}.json", key.file_stem()))
    }
}

#[async_trait]
impl SourceAdapter for FixtureDirAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_unit(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        key: &UnitKey,
    ) -> Result<FetchedUnit, AdapterError> {
        let path = self.path_for(ctx.period, key);
        let location = path.display().to_string();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(AdapterError::NoData {
                    attempted: vec![location],
                })
            }
            Err(err) => return Err(AdapterError::Transient(format!("{location}: {err}"))),
        };

        let payload = serde_json::from_slice(&bytes).map_err(|err| AdapterError::Parse {
            url: location.clone(),
            message: err.to_string(),
            body: bytes.clone(),
        })?;
        Ok(FetchedUnit {
            payload,
            provenance: Provenance {
                source_id: self.source_id.clone(),
                endpoint: Some("fixture".to_string()),
                source_url: Some(location.clone()),
                attempted: vec![location],
            },
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use statline_storage::{BackoffPolicy, HttpClientConfig};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            period: 2025,
            season_type: "regular".to_string(),
            credential: Some("secret".to_string()),
            params: BTreeMap::new(),
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(5),
                factor: 1.5,
                max_delay: Duration::from_millis(10),
            },
            politeness_delay: Duration::ZERO,
        })
        .expect("fetcher")
    }

    /// Answers each connection with the canned response registered for its path.
    async fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _, _)| path.starts_with(prefix))
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, ""));
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn cascade(base: &str) -> EndpointCascadeAdapter {
        EndpointCascadeAdapter::new(
            "cfbd",
            vec![
                EndpointTemplate {
                    name: "advanced".to_string(),
                    url: format!("{base}/games/box/advanced?year={{year}}&week={{week}}"),
                },
                EndpointTemplate {
                    name: "basic".to_string(),
                    url: format!("{base}/games/box?year={{year}}&week={{week}}"),
                },
            ],
        )
    }

    #[tokio::test]
    async fn cascade_falls_back_to_next_endpoint() {
        let base = serve(vec![
            ("/games/box/advanced", 404, ""),
            ("/games/box?", 200, r#"[{"id": 1}]"#),
        ])
        .await;
        let fetched = cascade(&base)
            .fetch_unit(&fetcher(), &ctx(), &UnitKey::week(2025, 3))
            .await
            .expect("fallback");
        assert_eq!(fetched.payload, json!([{"id": 1}]));
        assert_eq!(fetched.provenance.endpoint.as_deref(), Some("basic"));
        assert_eq!(fetched.provenance.attempted, vec!["advanced", "basic"]);
        assert!(fetched
            .provenance
            .source_url
            .unwrap()
            .ends_with("/games/box?year=2025&week=3"));
    }

    #[tokio::test]
    async fn cascade_reports_no_data_when_every_endpoint_is_missing() {
        let base = serve(vec![]).await;
        let err = cascade(&base)
            .fetch_unit(&fetcher(), &ctx(), &UnitKey::week(2025, 15))
            .await
            .expect_err("no data");
        match err {
            AdapterError::NoData { attempted } => assert_eq!(attempted, vec!["advanced", "basic"]),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn exhausted_server_errors_are_transient() {
        let base = serve(vec![("/games/box/advanced", 503, ""), ("/games/box?", 404, "")]).await;
        let err = cascade(&base)
            .fetch_unit(&fetcher(), &ctx(), &UnitKey::week(2025, 3))
            .await
            .expect_err("transient");
        assert!(matches!(err, AdapterError::Transient(reason) if reason.starts_with("advanced")));
    }

    #[tokio::test]
    async fn unparseable_body_keeps_diagnostic() {
        let base = serve(vec![("/games/box", 200, "<html>down</html>")]).await;
        let err = cascade(&base)
            .fetch_unit(&fetcher(), &ctx(), &UnitKey::week(2025, 3))
            .await
            .expect_err("parse");
        match err {
            AdapterError::Parse { body, .. } => assert_eq!(body, b"<html>down</html>".to_vec()),
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn date_units_expose_both_date_formats() {
        let key = UnitKey::date(NaiveDate::from_ymd_opt(2025, 7, 4).unwrap());
        let mut context = ctx();
        context.params.insert("league".to_string(), "wnba".to_string());
        let vars = template_vars(&context, &key);
        assert_eq!(vars["date"], "2025-07-04");
        assert_eq!(vars["date_compact"], "20250704");
        assert_eq!(vars["year"], "2025");
        assert_eq!(vars["league"], "wnba");
    }

    #[test]
    fn spec_validation_rejects_placeholders_the_unit_cannot_fill() {
        let spec = AdapterSpec::Http {
            endpoints: vec![EndpointTemplate {
                name: "scoreboard".to_string(),
                url: "https://site.test/scoreboard?dates={date_compact}".to_string(),
            }],
        };
        assert!(validate_spec(&spec, UnitKind::Date, &BTreeMap::new()).is_ok());
        assert!(validate_spec(&spec, UnitKind::Week, &BTreeMap::new()).is_err());
        assert!(validate_spec(
            &AdapterSpec::Http { endpoints: vec![] },
            UnitKind::Week,
            &BTreeMap::new()
        )
        .is_err());
    }

    #[tokio::test]
    async fn fixture_adapter_reads_period_files() {
        let dir = tempdir().expect("tempdir");
        let adapter = FixtureDirAdapter::new("replay", dir.path());
        let key = UnitKey::week(2025, 2);
        let path = adapter.path_for(2025, &key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"games": []}"#).unwrap();

        let fetched = adapter.fetch_unit(&fetcher(), &ctx(), &key).await.expect("fixture");
        assert_eq!(fetched.payload, json!({"games": []}));
        assert_eq!(fetched.provenance.endpoint.as_deref(), Some("fixture"));

        let missing = adapter
            .fetch_unit(&fetcher(), &ctx(), &UnitKey::week(2025, 3))
            .await
            .expect_err("missing");
        assert!(matches!(missing, AdapterError::NoData { .. }));
    }
}
