use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source tag written into every [`MeasurementMetadata`] produced by the agent.
pub const AGENT_SOURCE: &str = "Agent";

/// Operating system a job targets.
///
/// # Examples
///
/// ```
/// use oxbench_common::types::OperatingSystem;
///
/// let os: OperatingSystem = "Linux".parse().unwrap();
/// assert_eq!(os, OperatingSystem::Linux);
/// assert_eq!(os.to_string(), "linux");
/// assert!("beos".parse::<OperatingSystem>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingSystem {
    Windows,
    Linux,
    #[serde(alias = "osx", alias = "darwin")]
    MacOs,
}

impl OperatingSystem {
    /// The operating system the agent itself was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OperatingSystem::Windows
        } else if cfg!(target_os = "macos") {
            OperatingSystem::MacOs
        } else {
            OperatingSystem::Linux
        }
    }
}

impl Default for OperatingSystem {
    fn default() -> Self {
        Self::current()
    }
}

impl std::fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingSystem::Windows => write!(f, "windows"),
            OperatingSystem::Linux => write!(f, "linux"),
            OperatingSystem::MacOs => write!(f, "macos"),
        }
    }
}

impl std::str::FromStr for OperatingSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "windows" => Ok(OperatingSystem::Windows),
            "linux" => Ok(OperatingSystem::Linux),
            "macos" | "osx" | "darwin" => Ok(OperatingSystem::MacOs),
            _ => Err(format!("unknown operating system: {s}")),
        }
    }
}

/// Per-job switches that influence which counters are collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Collect CPU time of the Windows `lsass` process alongside machine CPU.
    #[serde(default, alias = "collect_lsass")]
    pub collect_lsass: bool,
}

/// Value of a single sample. Counters produce numbers, some sources report text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MeasurementValue {
    Number(f64),
    Text(String),
}

impl MeasurementValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MeasurementValue::Number(v) => Some(*v),
            MeasurementValue::Text(_) => None,
        }
    }
}

impl From<f64> for MeasurementValue {
    fn from(value: f64) -> Self {
        MeasurementValue::Number(value)
    }
}

impl From<String> for MeasurementValue {
    fn from(value: String) -> Self {
        MeasurementValue::Text(value)
    }
}

/// One observed sample of a named metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: MeasurementValue,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: impl Into<MeasurementValue>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// Aggregation applied across the samples of a series (`aggregate`) and
/// across the runs of a job (`reduce`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    First,
    Last,
    Avg,
    Sum,
    Median,
    Max,
    Min,
    Count,
    All,
    Delta,
}

/// Describes a metric series. Registered once per series, before its first
/// [`Measurement`] is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementMetadata {
    pub source: String,
    pub name: String,
    pub aggregate: Operation,
    pub reduce: Operation,
    pub format: String,
    pub long_description: String,
    pub short_description: String,
}

/// A decoded counter payload as delivered by a diagnostic stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterEvent {
    /// Event provider the counter was published under.
    pub provider: String,
    pub counter_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}
