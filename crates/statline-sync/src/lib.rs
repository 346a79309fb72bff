//! Batch orchestration: configuration, the unit fetcher, per-unit storage, compaction and run reports.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statline_adapters::{
    adapter_from_spec, validate_spec, AdapterContext, AdapterError, AdapterSpec, SourceAdapter,
};
use statline_compact::{CompactionOutcome, CompactionSettings, SeasonCompactor};
use statline_core::{
    template_placeholders, ConfigError, Provenance, Unit, UnitKey, UnitKind, UnitRange,
};
use statline_storage::{
    write_atomic, ArtifactScope, BackoffPolicy, EmptyPolicy, HttpClientConfig, HttpFetcher,
    StoreOptions, StoreOutcome, UnitStore,
};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statline-sync";

const CHANGE_FLAG: &str = "changed.flag";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub registry_path: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub politeness_ms: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("STATLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            registry_path: std::env::var("STATLINE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./datasets.yaml")),
            reports_dir: std::env::var("STATLINE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            user_agent: std::env::var("STATLINE_USER_AGENT")
                .unwrap_or_else(|_| "statline-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("STATLINE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            politeness_ms: std::env::var("STATLINE_POLITENESS_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            workspace_root: PathBuf::from("."),
        }
    }

    /// Rooted under one directory; used by tests and offline replays.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            data_dir: root.join("data"),
            registry_path: root.join("datasets.yaml"),
            reports_dir: root.join("reports"),
            user_agent: "statline-bot/0.1".to_string(),
            http_timeout_secs: 30,
            politeness_ms: 0,
            workspace_root: root.to_path_buf(),
        }
    }

    pub fn http_client_config(&self, retry: &RetryOverrides) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(retry.timeout_secs.unwrap_or(self.http_timeout_secs)),
            user_agent: Some(self.user_agent.clone()),
            backoff: retry.backoff(),
            politeness_delay: Duration::from_millis(self.politeness_ms),
        }
    }
}

/// Per-dataset tweaks to the default retry policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default)]
    pub max_attempts: Option<usize>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RetryOverrides {
    pub fn backoff(&self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            factor: self.factor.unwrap_or(defaults.factor),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_season_type() -> String {
    "regular".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub unit_kind: UnitKind,
    #[serde(default)]
    pub max_week: Option<u32>,
    #[serde(default = "default_season_type")]
    pub season_type: String,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub adapter: AdapterSpec,
    #[serde(default)]
    pub empty_policy: EmptyPolicy,
    #[serde(default)]
    pub retry: RetryOverrides,
    #[serde(default)]
    pub compaction: CompactionSettings,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("dataset id is empty".to_string()));
        }
        validate_spec(&self.adapter, self.unit_kind, &self.params)?;
        for name in template_placeholders(&self.compaction.output)? {
            if name != "year" {
                return Err(ConfigError::Invalid(format!(
                    "dataset {}: output {:?} may only use {{year}}",
                    self.id, self.compaction.output
                )));
            }
        }
        Ok(())
    }

    /// Looks up the credential variable; absence is fatal before any fetch.
    pub fn resolve_credential(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<String>, ConfigError> {
        let Some(var) = &self.credential_env else {
            return Ok(None);
        };
        match lookup(var) {
            Some(value) if !value.trim().is_empty() => Ok(Some(value)),
            _ => Err(ConfigError::MissingCredential(var.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

impl DatasetRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset registry")?;
        let mut seen = BTreeSet::new();
        for dataset in &registry.datasets {
            if !seen.insert(dataset.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate dataset id {}", dataset.id)).into());
            }
            dataset
                .validate()
                .with_context(|| format!("validating dataset {}", dataset.id))?;
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|dataset| dataset.id == id)
            .ok_or_else(|| ConfigError::UnknownDataset(id.to_string()))
    }

    pub fn describe(&self) -> String {
        let mut lines = vec!["# Datasets".to_string(), String::new()];
        for dataset in &self.datasets {
            let adapter = match &dataset.adapter {
                AdapterSpec::Http { endpoints } => format!(
                    "http ({})",
                    endpoints
                        .iter()
                        .map(|e| e.name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                ),
                AdapterSpec::Fixtures { dir } => format!("fixtures ({})", dir.display()),
            };
            lines.push(format!(
                "- `{}` {}{}: {:?} units, {}",
                dataset.id,
                dataset.display_name,
                if dataset.enabled { "" } else { " (disabled)" },
                dataset.unit_kind,
                adapter
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactWhen {
    /// Only when a unit changed or the table does not exist yet.
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for CompactWhen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown compact mode {other:?}; expected auto, always or never")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub year: i32,
    pub force_refresh: bool,
    pub dry_run: bool,
    pub compact: CompactWhen,
}

impl IngestOptions {
    pub fn for_year(year: i32) -> Self {
        Self {
            year,
            force_refresh: false,
            dry_run: false,
            compact: CompactWhen::Auto,
        }
    }
}

/// Fetches one unit through an adapter; "no data" comes back as a unit without payload.
pub struct UnitFetcher {
    adapter: Box<dyn SourceAdapter>,
    http: HttpFetcher,
    context: AdapterContext,
}

impl UnitFetcher {
    pub fn new(adapter: Box<dyn SourceAdapter>, http: HttpFetcher, context: AdapterContext) -> Self {
        Self {
            adapter,
            http,
            context,
        }
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }

    pub async fn fetch(&self, key: &UnitKey) -> Result<Unit, AdapterError> {
        match self.adapter.fetch_unit(&self.http, &self.context, key).await {
            Ok(fetched) => Ok(Unit {
                key: *key,
                payload: Some(fetched.payload),
                fetched_at: fetched.fetched_at,
                provenance: fetched.provenance,
            }),
            Err(AdapterError::NoData { attempted }) => Ok(Unit {
                key: *key,
                payload: None,
                fetched_at: Utc::now(),
                provenance: Provenance {
                    source_id: self.adapter.source_id().to_string(),
                    endpoint: None,
                    source_url: None,
                    attempted,
                },
            }),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Created,
    Updated,
    Unchanged,
    Placeholder,
    SkippedEmpty,
    Errored,
}

impl From<StoreOutcome> for UnitOutcome {
    fn from(outcome: StoreOutcome) -> Self {
        match outcome {
            StoreOutcome::Created => Self::Created,
            StoreOutcome::Updated => Self::Updated,
            StoreOutcome::Unchanged => Self::Unchanged,
            StoreOutcome::Placeholder => Self::Placeholder,
            StoreOutcome::SkippedEmpty => Self::SkippedEmpty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: UnitKey,
    pub outcome: UnitOutcome,
    pub no_data: bool,
    pub endpoint: Option<String>,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub diagnostic: Option<PathBuf>,
}

impl UnitReport {
    fn errored(unit: UnitKey, error: String) -> Self {
        Self {
            unit,
            outcome: UnitOutcome::Errored,
            no_data: false,
            endpoint: None,
            path: None,
            error: Some(error),
            diagnostic: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub no_data: usize,
    pub placeholder: usize,
    pub skipped_empty: usize,
    pub errored: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, report: &UnitReport) {
        if report.no_data {
            self.no_data += 1;
        }
        match report.outcome {
            UnitOutcome::Created => self.created += 1,
            UnitOutcome::Updated => self.updated += 1,
            UnitOutcome::Unchanged => self.unchanged += 1,
            UnitOutcome::Placeholder => self.placeholder += 1,
            UnitOutcome::SkippedEmpty => self.skipped_empty += 1,
            UnitOutcome::Errored => self.errored += 1,
        }
    }

    pub fn changed(&self) -> bool {
        self.created + self.updated + self.placeholder > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub period: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub force_refresh: bool,
    pub counts: OutcomeCounts,
    pub units: Vec<UnitReport>,
    #[serde(default)]
    pub compaction: Option<CompactionOutcome>,
    #[serde(default)]
    pub compaction_error: Option<String>,
}

impl BatchSummary {
    pub fn units_changed(&self) -> bool {
        self.counts.changed()
    }

    /// Anything a downstream publish step should pick up.
    pub fn changed(&self) -> bool {
        self.units_changed()
            || self
                .compaction
                .as_ref()
                .is_some_and(CompactionOutcome::changed)
    }

    pub fn one_line(&self) -> String {
        let c = &self.counts;
        format!(
            "{} {}: created={} updated={} unchanged={} no_data={} placeholder={} skipped_empty={} errored={} changed={}",
            self.dataset_id,
            self.period,
            c.created,
            c.updated,
            c.unchanged,
            c.no_data,
            c.placeholder,
            c.skipped_empty,
            c.errored,
            self.changed()
        )
    }

    pub fn to_markdown(&self) -> String {
        let c = &self.counts;
        let mut lines = vec![
            format!("# statline batch `{}`", self.run_id),
            String::new(),
            format!("- Dataset: `{}` period {}", self.dataset_id, self.period),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Dry run: {}", self.dry_run),
            format!("- Changed: {}", self.changed()),
            String::new(),
            "## Units".to_string(),
            format!("- created: {}", c.created),
            format!("- updated: {}", c.updated),
            format!("- unchanged: {}", c.unchanged),
            format!("- no data: {}", c.no_data),
            format!("- placeholder: {}", c.placeholder),
            format!("- skipped empty: {}", c.skipped_empty),
            format!("- errored: {}", c.errored),
        ];

        let failures: Vec<_> = self
            .units
            .iter()
            .filter(|unit| unit.outcome == UnitOutcome::Errored)
            .collect();
        if !failures.is_empty() {
            lines.push(String::new());
            lines.push("## Errors".to_string());
            for unit in failures {
                lines.push(format!(
                    "- {}: {}",
                    unit.unit,
                    unit.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        lines.push(String::new());
        lines.push("## Compaction".to_string());
        lines.push(match (&self.compaction, &self.compaction_error) {
            (_, Some(err)) => format!("- failed: {err}"),
            (None, None) if self.dry_run => "- skipped on dry run".to_string(),
            (None, None) => "- not run".to_string(),
            (Some(CompactionOutcome::NothingToCompile { reason, .. }), None) => {
                format!("- nothing to compile ({reason:?})")
            }
            (Some(CompactionOutcome::Written(report)), None) => format!(
                "- `{}`: {} rows from {} units, {} duplicates dropped, changed={}",
                report.path.display(),
                report.rows,
                report.units,
                report.duplicates_dropped,
                report.changed
            ),
        });
        lines.push(String::new());
        lines.join("\n")
    }
}

pub struct IngestPipeline {
    config: SyncConfig,
    dataset: DatasetConfig,
    options: IngestOptions,
    store: UnitStore,
    fetcher: UnitFetcher,
    run_id: Uuid,
}

impl IngestPipeline {
    /// Resolves the dataset credential from the environment and builds its adapter.
    pub fn new(config: SyncConfig, dataset: DatasetConfig, options: IngestOptions) -> Result<Self> {
        let credential = dataset.resolve_credential(|name| std::env::var(name).ok())?;
        let adapter = adapter_from_spec(&dataset.id, &dataset.adapter, &config.workspace_root);
        Self::with_adapter(config, dataset, options, adapter, credential)
    }

    pub fn with_adapter(
        config: SyncConfig,
        dataset: DatasetConfig,
        options: IngestOptions,
        adapter: Box<dyn SourceAdapter>,
        credential: Option<String>,
    ) -> Result<Self> {
        dataset.validate()?;
        if !dataset.enabled {
            return Err(ConfigError::Invalid(format!("dataset {} is disabled", dataset.id)).into());
        }

        let http = HttpFetcher::new(config.http_client_config(&dataset.retry))?;
        let run_id = Uuid::new_v4();
        let context = AdapterContext {
            run_id,
            period: options.year,
            season_type: dataset.season_type.clone(),
            credential,
            params: dataset.params.clone(),
        };
        let store = UnitStore::new(
            config.data_dir.clone(),
            StoreOptions {
                empty_policy: dataset.empty_policy,
                force_refresh: options.force_refresh,
                dry_run: options.dry_run,
            },
        );
        Ok(Self {
            config,
            dataset,
            options,
            store,
            fetcher: UnitFetcher::new(adapter, http, context),
            run_id,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn scope(&self) -> ArtifactScope {
        ArtifactScope::new(self.dataset.id.clone(), self.options.year)
    }

    pub fn compactor(&self) -> SeasonCompactor {
        SeasonCompactor::new(
            self.store.clone(),
            self.dataset.id.clone(),
            self.dataset.compaction.clone(),
        )
    }

    fn check_range(&self, range: &UnitRange) -> Result<(), ConfigError> {
        if range.kind() != self.dataset.unit_kind {
            return Err(ConfigError::InvalidRange(format!(
                "dataset {} is addressed by {:?} units",
                self.dataset.id, self.dataset.unit_kind
            )));
        }
        if let UnitRange::Weeks { year, .. } = range {
            if *year != self.options.year {
                return Err(ConfigError::InvalidRange(format!(
                    "week range year {year} does not match period {}",
                    self.options.year
                )));
            }
        }
        range.validate(self.dataset.max_week)
    }

    /// Fetch and store every unit of `range`, one at a time. Per-unit failures are recorded, not raised.
    pub async fn run_batch(&self, range: &UnitRange) -> Result<BatchSummary> {
        self.check_range(range)?;
        let started_at = Utc::now();
        let scope = self.scope();

        let mut counts = OutcomeCounts::default();
        let mut units = Vec::new();
        for key in range.keys() {
            let report = self.process_unit(&scope, &key).await;
            counts.record(&report);
            units.push(report);
        }

        let summary = BatchSummary {
            run_id: self.run_id,
            dataset_id: self.dataset.id.clone(),
            period: self.options.year,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.options.dry_run,
            force_refresh: self.options.force_refresh,
            counts,
            units,
            compaction: None,
            compaction_error: None,
        };
        info!(run_id = %self.run_id, summary = %summary.one_line(), "batch finished");
        Ok(summary)
    }

    async fn process_unit(&self, scope: &ArtifactScope, key: &UnitKey) -> UnitReport {
        let unit = match self.fetcher.fetch(key).await {
            Ok(unit) => unit,
            Err(AdapterError::Parse { url, message, body }) => {
                let diagnostic = match self.store.save_diagnostic(scope, key, &body).await {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(unit = %key, error = %err, "could not keep diagnostic body");
                        None
                    }
                };
                error!(unit = %key, %url, %message, "unit errored: unparseable response");
                let mut report = UnitReport::errored(*key, format!("unparseable response from {url}: {message}"));
                report.diagnostic = diagnostic;
                return report;
            }
            Err(err) => {
                error!(unit = %key, error = %err, "unit errored");
                return UnitReport::errored(*key, err.to_string());
            }
        };

        let no_data = !unit.has_data();
        match self.store.store_unit(scope, &unit, self.run_id).await {
            Ok(stored) => {
                info!(unit = %key, outcome = ?stored.outcome, no_data, "unit stored");
                UnitReport {
                    unit: *key,
                    outcome: stored.outcome.into(),
                    no_data,
                    endpoint: unit.provenance.endpoint,
                    path: Some(stored.path),
                    error: None,
                    diagnostic: None,
                }
            }
            Err(err) => {
                error!(unit = %key, error = ?err, "unit errored while storing");
                UnitReport::errored(*key, format!("{err:#}"))
            }
        }
    }

    pub async fn compact(&self) -> Result<CompactionOutcome> {
        self.compactor()
            .compact(self.options.year)
            .await
            .with_context(|| format!("compacting {} {}", self.dataset.id, self.options.year))
    }

    /// Batch, then compaction per [`CompactWhen`], then reports and the change flag.
    ///
    /// Dry runs never compact: the stored artifacts do not reflect their outcomes.
    /// A compaction failure is recorded in the summary and returned only after
    /// the reports and the change flag are written.
    pub async fn run(&self, range: &UnitRange) -> Result<BatchSummary> {
        let mut summary = self.run_batch(range).await?;

        let should_compact = match self.options.compact {
            _ if self.options.dry_run => false,
            CompactWhen::Always => true,
            CompactWhen::Never => false,
            CompactWhen::Auto => {
                summary.units_changed() || !self.compactor().output_path(self.options.year)?.exists()
            }
        };
        if self.options.dry_run && self.options.compact != CompactWhen::Never {
            info!(dataset = %self.dataset.id, "dry run: skipping compaction");
        }

        let mut failure = None;
        if should_compact {
            match self.compact().await {
                Ok(outcome) => summary.compaction = Some(outcome),
                Err(err) => {
                    error!(dataset = %self.dataset.id, error = ?err, "compaction failed");
                    summary.compaction_error = Some(format!("{err:#}"));
                    failure = Some(err);
                }
            }
        }
        summary.finished_at = Utc::now();

        if !self.options.dry_run {
            let reports_dir = write_reports(&self.config.reports_dir, &summary).await?;
            info!(reports = %reports_dir.display(), "wrote run report");
            if summary.changed() {
                let flag = write_change_flag(&self.store, &self.dataset.id).await?;
                info!(flag = %flag.display(), "marked dataset as changed");
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Compaction on its own, outside a batch.
pub async fn compact_dataset(
    config: &SyncConfig,
    dataset: &DatasetConfig,
    year: i32,
    dry_run: bool,
) -> Result<CompactionOutcome> {
    let store = UnitStore::new(config.data_dir.clone(), StoreOptions::default());
    let outcome = SeasonCompactor::new(store.clone(), dataset.id.clone(), dataset.compaction.clone())
        .with_dry_run(dry_run)
        .compact(year)
        .await
        .with_context(|| format!("compacting {} {year}", dataset.id))?;
    if !dry_run && outcome.changed() {
        write_change_flag(&store, &dataset.id).await?;
    }
    Ok(outcome)
}

pub async fn write_change_flag(store: &UnitStore, dataset_id: &str) -> Result<PathBuf> {
    let path = store.dataset_dir(dataset_id).join(CHANGE_FLAG);
    write_atomic(&path, b"true").await?;
    Ok(path)
}

pub async fn write_reports(reports_root: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing batch summary")?;
    fs::write(reports_dir.join("batch_summary.json"), json)
        .await
        .context("writing batch_summary.json")?;
    fs::write(reports_dir.join("summary.md"), summary.to_markdown())
        .await
        .context("writing summary.md")?;
    Ok(reports_dir)
}

/// Markdown digest of the most recent `runs` batch reports, newest first.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut lines = vec!["# statline recent runs".to_string(), String::new()];
    if !reports_root.exists() {
        lines.push("_no runs recorded yet_".to_string());
        return Ok(lines.join("\n"));
    }

    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let path = entry.path().join("batch_summary.json");
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<BatchSummary>(&text) {
            Ok(summary) => summaries.push(summary),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    for summary in summaries.into_iter().take(runs.max(1)) {
        let c = &summary.counts;
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- dataset: `{}` period {}", summary.dataset_id, summary.period));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- units: {} created, {} updated, {} unchanged, {} no data, {} errored",
            c.created, c.updated, c.unchanged, c.no_data, c.errored
        ));
        lines.push(format!("- changed: {}", summary.changed()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
