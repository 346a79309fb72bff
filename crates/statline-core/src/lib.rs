//! Core unit, range and provenance types for statline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "statline-core";

/// Raw structured response for one unit. Scalars, sequences and ordered mappings.
pub type Payload = Value;

const DATE_STEM_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingCredential(String),
    #[error("invalid unit range: {0}")]
    InvalidRange(String),
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Week,
    Date,
}

/// Ordered identifier of one fetch target. Lexical order of [`UnitKey::file_stem`]
/// matches the `Ord` order for keys of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKey {
    Week { year: i32, week: u32 },
    Date { date: NaiveDate },
}

impl UnitKey {
    pub fn week(year: i32, week: u32) -> Self {
        Self::Week { year, week }
    }

    pub fn date(date: NaiveDate) -> Self {
        Self::Date { date }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Week { .. } => UnitKind::Week,
            Self::Date { .. } => UnitKind::Date,
        }
    }

    pub fn file_stem(&self) -> String {
        match self {
            Self::Week { week, .. } => format!("week_{week:02}"),
            Self::Date { date } => date.format(DATE_STEM_FORMAT).to_string(),
        }
    }

    /// Recovers a key from an artifact file stem. Week stems carry no year, so the
    /// period is supplied by the caller.
    pub fn from_file_stem(stem: &str, period: i32) -> Option<Self> {
        if let Some(week) = stem.strip_prefix("week_") {
            return week.parse().ok().map(|week| Self::week(period, week));
        }
        NaiveDate::parse_from_str(stem, DATE_STEM_FORMAT)
            .ok()
            .map(Self::date)
    }

    /// Columns that tag every compacted row with the unit it came from.
    pub fn identity_columns(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Week { week, .. } => vec![("week", week.to_string())],
            Self::Date { date } => vec![("date", date.format(DATE_STEM_FORMAT).to_string())],
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Week { year, week } => write!(f, "{year} week {week}"),
            Self::Date { date } => write!(f, "{}", date.format(DATE_STEM_FORMAT)),
        }
    }
}

/// Inclusive range of units a batch walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitRange {
    Weeks { year: i32, start: u32, end: u32 },
    Dates { start: NaiveDate, end: NaiveDate },
}

impl UnitRange {
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Weeks { .. } => UnitKind::Week,
            Self::Dates { .. } => UnitKind::Date,
        }
    }

    pub fn validate(&self, max_week: Option<u32>) -> Result<(), ConfigError> {
        match *self {
            Self::Weeks { start, end, .. } => {
                if start == 0 {
                    return Err(ConfigError::InvalidRange("weeks start at 1".to_string()));
                }
                if start > end {
                    return Err(ConfigError::InvalidRange(format!(
                        "start week {start} is after end week {end}"
                    )));
                }
                if let Some(max) = max_week {
                    if end > max {
                        return Err(ConfigError::InvalidRange(format!(
                            "end week {end} exceeds the last week {max}"
                        )));
                    }
                }
                Ok(())
            }
            Self::Dates { start, end } => {
                if start > end {
                    return Err(ConfigError::InvalidRange(format!(
                        "start date {start} is after end date {end}"
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        match *self {
            Self::Weeks { year, start, end } => {
                (start..=end).map(|week| UnitKey::week(year, week)).collect()
            }
            Self::Dates { start, end } => start
                .iter_days()
                .take_while(|day| *day <= end)
                .map(UnitKey::date)
                .collect(),
        }
    }
}

/// Which source produced a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub endpoint: Option<String>,
    pub source_url: Option<String>,
    #[serde(default)]
    pub attempted: Vec<String>,
}

/// One atomic fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub key: UnitKey,
    pub payload: Option<Payload>,
    pub fetched_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl Unit {
    pub fn has_data(&self) -> bool {
        self.payload.as_ref().is_some_and(|p| !is_empty_payload(p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Data,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub unit: UnitKey,
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub status: UnitStatus,
    pub fingerprint: String,
    pub provenance: Provenance,
    #[serde(default)]
    pub note: Option<String>,
}

/// On-disk form of a unit artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEnvelope {
    #[serde(rename = "_meta")]
    pub meta: UnitMeta,
    pub data: Payload,
}

/// `null`, `[]` and `{}` all mean the source had nothing for the unit.
pub fn is_empty_payload(payload: &Payload) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Rebuilds `value` with every object's keys sorted, recursively.
pub fn canonicalize(value: &Payload) -> Payload {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Names of the `{placeholder}`s in `template`, in order of appearance.
pub fn template_placeholders(template: &str) -> Result<Vec<&str>, ConfigError> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Invalid(format!("unclosed placeholder in {template:?}")))?;
        names.push(&after[..end]);
        rest = &after[end + 1..];
    }
    Ok(names)
}

/// Substitutes every `{name}` in `template` from `vars`; unknown names are an error.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Invalid(format!("unclosed placeholder in {template:?}")))?;
        let name = &after[..end];
        let value = vars.get(name).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown placeholder {{{name}}} in {template:?}"))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
