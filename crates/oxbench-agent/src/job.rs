use crate::error::{AgentError, Result};
use crate::uri::UriValidator;
use chrono::{DateTime, Utc};
use oxbench_common::types::{JobOptions, Measurement, MeasurementMetadata, OperatingSystem};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// A job as submitted to the agent, before it is registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Must be 0 (unassigned) for a new submission.
    #[serde(default)]
    pub id: u64,
    pub service: String,
    #[serde(default)]
    pub operating_system: OperatingSystem,
    #[serde(default)]
    pub options: JobOptions,
    /// Benchmark process to launch.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// URLs the job wants fetched before it runs.
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl JobDefinition {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read job file '{path}': {e}"))?;
        let definition: Self = toml::from_str(&content)?;
        Ok(definition)
    }

    /// Checks every attachment URL against `validator`.
    pub fn validate_attachments(&self, validator: &UriValidator) -> Result<()> {
        match self.attachments.iter().find(|uri| !validator.is_valid(uri)) {
            Some(uri) => Err(AgentError::RejectedUri { uri: uri.clone() }),
            None => Ok(()),
        }
    }
}

/// One benchmark execution tracked by the agent.
///
/// The measurement and metadata queues are appended to concurrently by the
/// job's telemetry session and read by whoever reports on the job.
#[derive(Debug)]
pub struct Job {
    id: u64,
    service: String,
    operating_system: OperatingSystem,
    options: JobOptions,
    executable: Option<String>,
    arguments: Vec<String>,
    attachments: Vec<String>,
    created_at: DateTime<Utc>,
    measurements: Mutex<VecDeque<Measurement>>,
    metadata: Mutex<Vec<MeasurementMetadata>>,
    ending: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    pub fn new(service: impl Into<String>, operating_system: OperatingSystem, options: JobOptions) -> Self {
        Self::from_definition(JobDefinition {
            service: service.into(),
            operating_system,
            options,
            ..JobDefinition::default()
        })
    }

    pub fn from_definition(definition: JobDefinition) -> Self {
        let (ending, _) = watch::channel(false);
        Self {
            id: definition.id,
            service: definition.service,
            operating_system: definition.operating_system,
            options: definition.options,
            executable: definition.executable,
            arguments: definition.arguments,
            attachments: definition.attachments,
            created_at: Utc::now(),
            measurements: Mutex::new(VecDeque::new()),
            metadata: Mutex::new(Vec::new()),
            ending,
        }
    }

    /// Registry assigned id, 0 while unregistered.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn assign_id(&mut self, id: u64) {
        debug_assert_eq!(self.id, 0, "job id is immutable once assigned");
        self.id = id;
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operating_system(&self) -> OperatingSystem {
        self.operating_system
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn executable(&self) -> Option<&str> {
        self.executable.as_deref()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn attachments(&self) -> &[String] {
        &self.attachments
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn push_measurement(&self, measurement: Measurement) {
        lock(&self.measurements).push_back(measurement);
    }

    /// Snapshot of the measurements in append order.
    pub fn measurements(&self) -> Vec<Measurement> {
        lock(&self.measurements).iter().cloned().collect()
    }

    pub fn measurement_count(&self) -> usize {
        lock(&self.measurements).len()
    }

    /// Removes and returns everything appended so far.
    pub fn drain_measurements(&self) -> Vec<Measurement> {
        lock(&self.measurements).drain(..).collect()
    }

    /// Records the description of a series. Returns `false` and keeps the
    /// existing entry if a series with the same name is already described.
    pub fn register_metadata(&self, metadata: MeasurementMetadata) -> bool {
        let mut entries = lock(&self.metadata);
        if entries.iter().any(|m| m.name == metadata.name) {
            return false;
        }
        entries.push(metadata);
        true
    }

    /// Drops the descriptions of series that will never produce data.
    pub fn withdraw_metadata(&self, names: &[String]) {
        lock(&self.metadata).retain(|m| !names.contains(&m.name));
    }

    pub fn metadata(&self) -> Vec<MeasurementMetadata> {
        lock(&self.metadata).clone()
    }

    /// Raises the job's ending signal. The signal is level triggered and
    /// stays raised.
    pub fn mark_ending(&self) {
        self.ending.send_replace(true);
    }

    pub fn is_ending(&self) -> bool {
        *self.ending.borrow()
    }

    /// Receiver observing the ending signal, for racing against job work.
    pub fn ending_signal(&self) -> watch::Receiver<bool> {
        self.ending.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxbench_common::types::{Operation, AGENT_SOURCE};

    fn meta(name: &str) -> MeasurementMetadata {
        MeasurementMetadata {
            source: AGENT_SOURCE.to_string(),
            name: name.to_string(),
            aggregate: Operation::Avg,
            reduce: Operation::Max,
            format: "n2".to_string(),
            long_description: String::new(),
            short_description: String::new(),
        }
    }

    #[test]
    fn metadata_registered_once_per_name() {
        let job = Job::new("web", OperatingSystem::Linux, JobOptions::default());
        assert!(job.register_metadata(meta("machine/cpu")));
        assert!(!job.register_metadata(meta("machine/cpu")));
        assert!(job.register_metadata(meta("machine/cpu/lsass")));
        assert_eq!(job.metadata().len(), 2);

        job.withdraw_metadata(&["machine/cpu".to_string()]);
        let names: Vec<String> = job.metadata().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["machine/cpu/lsass"]);
    }

    #[test]
    fn measurements_keep_append_order() {
        let job = Job::new("web", OperatingSystem::Linux, JobOptions::default());
        let now = Utc::now();
        for i in 0..5 {
            job.push_measurement(Measurement::new("machine/cpu", f64::from(i), now));
        }
        let values: Vec<f64> = job
            .measurements()
            .iter()
            .filter_map(|m| m.value.as_f64())
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(job.drain_measurements().len(), 5);
        assert_eq!(job.measurement_count(), 0);
    }

    #[test]
    fn ending_signal_is_level_triggered() {
        let job = Job::new("web", OperatingSystem::Windows, JobOptions::default());
        let early = job.ending_signal();
        assert!(!job.is_ending());

        job.mark_ending();
        job.mark_ending();

        let late = job.ending_signal();
        assert!(job.is_ending());
        assert!(*early.borrow());
        assert!(*late.borrow());
    }

    #[test]
    fn attachments_checked_against_allow_list() {
        let validator = UriValidator::new(["example.com"]);
        let mut definition = JobDefinition {
            service: "web".to_string(),
            attachments: vec!["https://cdn.example.com/app.zip".to_string()],
            ..JobDefinition::default()
        };
        assert!(definition.validate_attachments(&validator).is_ok());

        definition.attachments.push("http://169.254.169.254/latest/meta-data".to_string());
        let err = definition.validate_attachments(&validator).unwrap_err();
        assert!(matches!(err, AgentError::RejectedUri { ref uri } if uri.contains("169.254")));
    }

    #[test]
    fn definition_parses_from_toml() {
        let definition: JobDefinition = toml::from_str(
            r#"
            service = "json-bench"
            operating_system = "windows"
            executable = "bench.exe"
            arguments = ["--duration", "15"]

            [options]
            collect_lsass = true
            "#,
        )
        .unwrap();

        assert_eq!(definition.id, 0);
        assert_eq!(definition.operating_system, OperatingSystem::Windows);
        assert!(definition.options.collect_lsass);

        let job = Job::from_definition(definition);
        assert_eq!(job.id(), 0);
        assert_eq!(job.executable(), Some("bench.exe"));
        assert_eq!(job.arguments().len(), 2);
    }
}
