//! Season compaction: flatten unit artifacts into one aligned, de-duplicated table.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use indexmap::IndexMap;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statline_core::{render_template, Payload, UnitEnvelope, UnitKey};
use statline_storage::{write_atomic, ArtifactScope, UnitStore};
use tokio::fs;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "statline-compact";

/// One flattened record before it is rendered to text cells.
pub type FlatRecord = IndexMap<String, Value>;
/// One table row: column name to rendered cell.
pub type Row = IndexMap<String, String>;

fn default_separator() -> String {
    "_".to_string()
}

/// How a unit payload turns into rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenRules {
    /// Dot path to the node holding the records, e.g. `games` or `data.events`.
    #[serde(default)]
    pub record_path: Option<String>,
    /// Nested sequence expanded into one row per child, carrying the parent's fields.
    #[serde(default)]
    pub explode: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Replacement prefixes for top-level nested mappings (`offense` -> `off`).
    #[serde(default)]
    pub prefix_aliases: BTreeMap<String, String>,
}

impl Default for FlattenRules {
    fn default() -> Self {
        Self {
            record_path: None,
            explode: None,
            separator: default_separator(),
            prefix_aliases: BTreeMap::new(),
        }
    }
}

pub fn select_records<'a>(payload: &'a Value, record_path: Option<&str>) -> Option<&'a Value> {
    let Some(path) = record_path else {
        return Some(payload);
    };
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(payload, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Flatten a payload into records. `null` or a missing record node yields no records.
pub fn flatten_payload(payload: &Value, rules: &FlattenRules) -> Vec<FlatRecord> {
    match select_records(payload, rules.record_path.as_deref()) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| flatten_record(item, rules))
            .collect(),
        Some(node) => flatten_record(node, rules),
    }
}

fn flatten_record(record: &Value, rules: &FlattenRules) -> Vec<FlatRecord> {
    let Value::Object(map) = record else {
        if record.is_null() {
            return Vec::new();
        }
        let mut row = FlatRecord::new();
        row.insert("value".to_string(), scalar_cell(record));
        return vec![row];
    };

    let exploded = rules
        .explode
        .as_deref()
        .and_then(|field| map.get(field).and_then(Value::as_array).map(|children| (field, children)));

    let Some((field, children)) = exploded else {
        let mut row = FlatRecord::new();
        flatten_into(&mut row, None, map, rules);
        return vec![row];
    };

    let mut parent = FlatRecord::new();
    let without_children: Map<String, Value> = map
        .iter()
        .filter(|(key, _)| key.as_str() != field)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    flatten_into(&mut parent, None, &without_children, rules);

    children
        .iter()
        .map(|child| {
            let mut row = parent.clone();
            match child {
                Value::Object(child_map) => flatten_into(&mut row, None, child_map, rules),
                other => {
                    row.insert(field.to_string(), scalar_cell(other));
                }
            }
            row
        })
        .collect()
}

fn flatten_into(row: &mut FlatRecord, prefix: Option<&str>, map: &Map<String, Value>, rules: &FlattenRules) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{prefix}{}{key}", rules.separator),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => {
                let nested_prefix = match prefix {
                    None => rules.prefix_aliases.get(key).cloned().unwrap_or(name),
                    Some(_) => name,
                };
                flatten_into(row, Some(nested_prefix.as_str()), nested, rules);
            }
            other => {
                row.insert(name, scalar_cell(other));
            }
        }
    }
}

/// Sequences inside a record stay in one cell as compact JSON.
fn scalar_cell(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

pub fn render_cell(value: &Value, null_marker: &str) -> String {
    match value {
        Value::Null => null_marker.to_string(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Renames active for a range of periods. Open ends apply to every period on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingVersion {
    #[serde(default)]
    pub from_period: Option<i32>,
    #[serde(default)]
    pub until_period: Option<i32>,
    pub renames: IndexMap<String, String>,
}

impl MappingVersion {
    pub fn applies_to(&self, period: i32) -> bool {
        self.from_period.map_or(true, |from| from <= period)
            && self.until_period.map_or(true, |until| period <= until)
    }
}

/// Versioned field-name mapping absorbing upstream schema drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    pub versions: Vec<MappingVersion>,
}

impl FieldMapping {
    pub fn renames_for(&self, period: i32) -> IndexMap<String, String> {
        self.versions
            .iter()
            .filter(|version| version.applies_to(period))
            .flat_map(|version| version.renames.clone())
            .collect()
    }

    /// Rename fields in place. When the target already holds a value, that value is kept.
    pub fn apply(&self, renames: &IndexMap<String, String>, record: &mut FlatRecord) {
        for (from, to) in renames {
            let Some((index, _, value)) = record.shift_remove_full(from.as_str()) else {
                continue;
            };
            match record.get_mut(to.as_str()) {
                Some(existing) if !existing.is_null() => {}
                Some(existing) => *existing = value,
                None => {
                    record.shift_insert(index, to.clone(), value);
                }
            }
        }
    }
}

/// Put the unit identity columns first, overriding same-named payload fields.
pub fn tag_record(key: &UnitKey, record: FlatRecord, null_marker: &str) -> Row {
    let identity = key.identity_columns();
    let mut row: Row = identity
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    for (name, value) in record {
        if identity.iter().any(|(id, _)| *id == name) {
            continue;
        }
        row.insert(name, render_cell(&value, null_marker));
    }
    row
}

/// Reference columns first in reference order, then unseen columns in first-seen order.
pub fn align_columns(rows: &[Row], reference: Option<&[String]>) -> Vec<String> {
    let mut columns: IndexMap<String, ()> = reference
        .unwrap_or_default()
        .iter()
        .map(|column| (column.clone(), ()))
        .collect();
    for row in rows {
        for name in row.keys() {
            if !columns.contains_key(name) {
                columns.insert(name.clone(), ());
            }
        }
    }
    columns.into_keys().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn from_rows(columns: Vec<String>, rows: &[Row], null_marker: &str) -> Self {
        let rows = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or_else(|| null_marker.to_string()))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Keep only the last row of each key, at the position of that last occurrence.
    /// Returns the number of rows dropped, or `None` when a key column is absent.
    /// Rows whose key cells are all `null_marker` have no identity and are always kept.
    pub fn dedup_keep_last(&mut self, key: &[String], null_marker: &str) -> Option<usize> {
        let indexes = key
            .iter()
            .map(|name| self.column_index(name))
            .collect::<Option<Vec<_>>>()?;

        let keep: Vec<bool> = {
            let key_of = |row: &[String]| -> Vec<String> {
                indexes.iter().map(|&i| row[i].clone()).collect()
            };
            let blank = |cells: &[String]| cells.iter().all(|cell| cell == null_marker);
            let mut last_seen: HashMap<Vec<String>, usize> = HashMap::new();
            for (position, row) in self.rows.iter().enumerate() {
                let cells = key_of(row.as_slice());
                if !blank(&cells) {
                    last_seen.insert(cells, position);
                }
            }
            self.rows
                .iter()
                .enumerate()
                .map(|(position, row)| {
                    let cells = key_of(row.as_slice());
                    blank(&cells) || last_seen.get(&cells) == Some(&position)
                })
                .collect()
        };

        let before = self.rows.len();
        let mut flags = keep.into_iter();
        self.rows.retain(|_| flags.next().unwrap_or(false));
        Some(before - self.rows.len())
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.columns)
            .context("writing csv header")?;
        for row in &self.rows {
            writer.write_record(row).context("writing csv row")?;
        }
        writer
            .into_inner()
            .map_err(|err| anyhow::anyhow!("flushing csv buffer: {}", err.error()))
    }

    /// All columns as nullable UTF-8; cells equal to the null marker become nulls.
    pub fn to_parquet_bytes(&self, null_marker: &str) -> Result<Vec<u8>> {
        let schema = Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|name| ArrowField::new(name, DataType::Utf8, true))
                .collect::<Vec<_>>(),
        ));
        let arrays = (0..self.columns.len())
            .map(|i| {
                let values = self
                    .rows
                    .iter()
                    .map(|row| Some(row[i].as_str()).filter(|cell| *cell != null_marker))
                    .collect::<Vec<_>>();
                Arc::new(StringArray::from(values)) as ArrayRef
            })
            .collect::<Vec<_>>();
        let batch = RecordBatch::try_new(schema, arrays).context("building compacted record batch")?;

        let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
            .context("opening parquet writer")?;
        writer.write(&batch).context("writing parquet batch")?;
        writer.into_inner().context("closing parquet writer")
    }
}

pub fn header_from_csv(bytes: &[u8]) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let header = reader.headers().context("reading csv header")?;
    Ok(header.iter().map(str::to_string).collect())
}

/// Header row of an existing table, if there is one.
pub async fn read_header(path: &Path) -> Result<Option<Vec<String>>> {
    match fs::read(path).await {
        Ok(bytes) => header_from_csv(&bytes)
            .with_context(|| format!("reading header of {}", path.display()))
            .map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    None,
    #[default]
    PreviousPeriod,
    Path,
}

fn default_output() -> String {
    "{year}_compiled.csv".to_string()
}

/// Per-dataset compaction settings, as written in the dataset registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Table file under the dataset directory; `{year}` is the period.
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(flatten)]
    pub flatten: FlattenRules,
    #[serde(default)]
    pub field_mappings: FieldMapping,
    #[serde(default)]
    pub dedup_key: Vec<String>,
    #[serde(default)]
    pub reference_schema: ReferenceMode,
    #[serde(default)]
    pub reference_path: Option<PathBuf>,
    #[serde(default)]
    pub null_marker: String,
    #[serde(default)]
    pub parquet: bool,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            output: default_output(),
            flatten: FlattenRules::default(),
            field_mappings: FieldMapping::default(),
            dedup_key: Vec::new(),
            reference_schema: ReferenceMode::default(),
            reference_path: None,
            null_marker: String::new(),
            parquet: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NothingReason {
    NoArtifacts,
    AllUnreadable,
    NoRows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
    pub units: usize,
    pub unreadable: Vec<PathBuf>,
    pub duplicates_dropped: usize,
    pub changed: bool,
    pub parquet: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompactionOutcome {
    NothingToCompile {
        reason: NothingReason,
        unreadable: Vec<PathBuf>,
    },
    Written(CompactionReport),
}

impl CompactionOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Written(report) if report.changed)
    }
}

/// Rebuilds one dataset's period table from its unit artifacts.
#[derive(Debug, Clone)]
pub struct SeasonCompactor {
    store: UnitStore,
    dataset_id: String,
    settings: CompactionSettings,
    dry_run: bool,
}

impl SeasonCompactor {
    pub fn new(store: UnitStore, dataset_id: impl Into<String>, settings: CompactionSettings) -> Self {
        let dry_run = store.options().dry_run;
        Self {
            store,
            dataset_id: dataset_id.into(),
            settings,
            dry_run,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn output_path(&self, period: i32) -> Result<PathBuf> {
        let vars = BTreeMap::from([("year".to_string(), period.to_string())]);
        let name = render_template(&self.settings.output, &vars)
            .with_context(|| format!("rendering output name for {}", self.dataset_id))?;
        Ok(self.store.dataset_dir(&self.dataset_id).join(name))
    }

    async fn reference_header(&self, period: i32) -> Result<Option<Vec<String>>> {
        match self.settings.reference_schema {
            ReferenceMode::None => Ok(None),
            ReferenceMode::PreviousPeriod => read_header(&self.output_path(period - 1)?).await,
            ReferenceMode::Path => {
                let Some(path) = &self.settings.reference_path else {
                    anyhow::bail!("dataset {} sets reference_schema: path without reference_path", self.dataset_id);
                };
                let path = self.store.dataset_dir(&self.dataset_id).join(path);
                read_header(&path).await
            }
        }
    }

    pub async fn compact(&self, period: i32) -> Result<CompactionOutcome> {
        let scope = ArtifactScope::new(self.dataset_id.clone(), period);
        let artifacts = self.store.list_artifacts(&scope).await?;
        if artifacts.is_empty() {
            info!(dataset = %self.dataset_id, period, "nothing to compile: no artifacts");
            return Ok(CompactionOutcome::NothingToCompile {
                reason: NothingReason::NoArtifacts,
                unreadable: Vec::new(),
            });
        }

        let renames = self.settings.field_mappings.renames_for(period);
        let null_marker = self.settings.null_marker.as_str();
        let mut rows = Vec::new();
        let mut unreadable = Vec::new();
        let mut units = 0usize;

        for path in &artifacts {
            let (key, payload) = match load_artifact(path, period).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable artifact");
                    unreadable.push(path.clone());
                    continue;
                }
            };
            units += 1;
            for mut record in flatten_payload(&payload, &self.settings.flatten) {
                self.settings.field_mappings.apply(&renames, &mut record);
                rows.push(tag_record(&key, record, null_marker));
            }
        }

        if units == 0 {
            warn!(dataset = %self.dataset_id, period, unreadable = unreadable.len(), "nothing to compile: every artifact unreadable");
            return Ok(CompactionOutcome::NothingToCompile {
                reason: NothingReason::AllUnreadable,
                unreadable,
            });
        }
        if rows.is_empty() {
            info!(dataset = %self.dataset_id, period, units, "nothing to compile: artifacts hold no rows");
            return Ok(CompactionOutcome::NothingToCompile {
                reason: NothingReason::NoRows,
                unreadable,
            });
        }

        // Key columns must come from the data, not from a reference header.
        let key_in_data = self
            .settings
            .dedup_key
            .iter()
            .all(|name| rows.iter().any(|row| row.contains_key(name)));

        let reference = self.reference_header(period).await?;
        let columns = align_columns(&rows, reference.as_deref());
        let mut table = Table::from_rows(columns, &rows, null_marker);

        let mut duplicates_dropped = 0;
        if !self.settings.dedup_key.is_empty() {
            let dropped = if key_in_data {
                table.dedup_keep_last(&self.settings.dedup_key, null_marker)
            } else {
                None
            };
            match dropped {
                Some(dropped) => duplicates_dropped = dropped,
                None => warn!(dataset = %self.dataset_id, key = ?self.settings.dedup_key, "dedup key columns missing; keeping every row"),
            }
        }

        let output = self.output_path(period)?;
        let bytes = table.to_csv_bytes()?;
        let changed = match fs::read(&output).await {
            Ok(previous) => previous != bytes,
            Err(_) => true,
        };

        let mut parquet = None;
        if !self.dry_run {
            write_atomic(&output, &bytes).await?;
            if self.settings.parquet {
                let parquet_path = output.with_extension("parquet");
                let parquet_bytes = table.to_parquet_bytes(null_marker)?;
                write_atomic(&parquet_path, &parquet_bytes).await?;
                parquet = Some(parquet_path);
            }
        }

        info!(
            dataset = %self.dataset_id,
            period,
            rows = table.rows.len(),
            units,
            duplicates_dropped,
            changed,
            path = %output.display(),
            "compacted period"
        );
        Ok(CompactionOutcome::Written(CompactionReport {
            path: output,
            rows: table.rows.len(),
            columns: table.columns,
            units,
            unreadable,
            duplicates_dropped,
            changed,
            parquet,
        }))
    }
}

/// Reads an envelope, or a bare legacy payload whose unit comes from the file name.
async fn load_artifact(path: &Path, period: i32) -> Result<(UnitKey, Payload)> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value: Value =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;

    if value.get("_meta").is_some() && value.get("data").is_some() {
        let envelope: UnitEnvelope = serde_json::from_value(value)
            .with_context(|| format!("decoding envelope {}", path.display()))?;
        return Ok((envelope.meta.unit, envelope.data));
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let key = UnitKey::from_file_stem(&stem, period)
        .with_context(|| format!("no unit key in artifact name {}", path.display()))?;
    Ok((key, value))
}
