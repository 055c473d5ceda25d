use oxbench_agent::config::AgentConfig;
use oxbench_agent::error::AgentError;
use oxbench_agent::job::{Job, JobDefinition};
use oxbench_agent::registry::JobRegistry;
use oxbench_agent::telemetry::{InProcessTransport, SessionState, StreamOutcome, TelemetrySession};
use oxbench_agent::uri::UriValidator;
use oxbench_collector::windows::WindowsMachineCpuEmitter;
use oxbench_collector::{CounterSink, MACHINE_CPU_MEASUREMENT};
use oxbench_common::types::OperatingSystem;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

const AGENT_CONFIG: &str = r#"
agent_name = "bench-01"
allowed_domains = ["assets.example.com"]

[telemetry]
sampling_interval_ms = 200
event_buffer = 64
"#;

const JOB: &str = r#"
service = "json"
operating_system = "windows"
executable = "bench"
arguments = ["--duration", "5"]
attachments = ["https://cdn.assets.example.com/payload.zip"]

[options]
collect_lsass = true
"#;

#[test]
fn job_files_load_validate_and_register() {
    let config_file = write_file(AGENT_CONFIG);
    let job_file = write_file(JOB);

    let config = AgentConfig::load(config_file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.agent_name, "bench-01");
    assert_eq!(config.telemetry.provider, "Oxbench-MachineCounters");

    let registry = JobRegistry::with_allowed_domains(config.allowed_domains.clone());
    let validator = UriValidator::new(registry.allowed_domains());

    let definition = JobDefinition::load(job_file.path().to_str().unwrap()).unwrap();
    definition.validate_attachments(&validator).unwrap();

    let job = registry.add(Job::from_definition(definition)).unwrap();
    assert_eq!(job.id(), 1);
    assert_eq!(job.operating_system(), OperatingSystem::Windows);
    assert!(job.options().collect_lsass);
    assert_eq!(job.arguments(), ["--duration", "5"]);
    assert!(Arc::ptr_eq(&registry.find(1).unwrap(), &job));
}

#[test]
fn attachments_outside_allow_list_are_rejected() {
    let job_file = write_file(
        r#"
service = "json"
attachments = ["https://assets.example.com/ok.zip", "https://evil.net/payload.zip"]
"#,
    );
    let definition = JobDefinition::load(job_file.path().to_str().unwrap()).unwrap();
    let validator = UriValidator::new(["assets.example.com"]);

    match definition.validate_attachments(&validator) {
        Err(AgentError::RejectedUri { uri }) => assert_eq!(uri, "https://evil.net/payload.zip"),
        other => panic!("expected rejected uri, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn machine_cpu_flows_into_job_until_removed() {
    let registry = JobRegistry::new();
    let job = registry
        .add(Job::new("plaintext", OperatingSystem::Linux, Default::default()))
        .unwrap();

    let sink = CounterSink::new("Oxbench-MachineCounters", 64);
    let transport = Arc::new(InProcessTransport::new(sink.clone()));
    let mut session = TelemetrySession::new(Arc::clone(&job), transport, sink, Default::default());
    assert!(session.register_emitter(Box::new(WindowsMachineCpuEmitter::new(Duration::from_millis(200)))));
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    let ending = job.ending_signal();
    let telemetry = tokio::spawn(async move { session.run(ending).await });

    tokio::time::timeout(Duration::from_secs(10), async {
        while job.measurement_count() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no machine cpu sample within timeout");

    registry.remove(job.id());
    let summary = tokio::time::timeout(Duration::from_secs(5), telemetry)
        .await
        .expect("session did not stop after job removal")
        .unwrap();

    assert_eq!(summary.outcome, StreamOutcome::Closed);
    assert_eq!(summary.emitters_disposed, 1);
    assert_eq!(summary.disposal_failures, 0);
    assert!(summary.stop_error.is_none());

    let metadata = job.metadata();
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata[0].name, MACHINE_CPU_MEASUREMENT);

    let measurements = job.measurements();
    assert!(!measurements.is_empty());
    assert_eq!(summary.measurements, measurements.len() as u64);
    for m in &measurements {
        assert_eq!(m.name, MACHINE_CPU_MEASUREMENT);
        let value = m.value.as_f64().unwrap();
        assert!((0.0..=100.0).contains(&value), "cpu {value} out of range");
    }
}

#[tokio::test]
async fn foreign_process_leaves_job_without_metadata() {
    let job = Arc::new(Job::new("fortunes", OperatingSystem::Linux, Default::default()));
    let sink = CounterSink::new("Oxbench-MachineCounters", 16);
    let transport = Arc::new(InProcessTransport::new(sink.clone()));
    let mut session = TelemetrySession::new(Arc::clone(&job), transport, sink, Default::default())
        .with_target_pid(std::process::id().wrapping_add(1));

    assert_eq!(session.register_counters(), 1);
    assert_eq!(job.metadata().len(), 1);

    assert!(session.start().await.is_err());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(job.metadata().is_empty());
    assert_eq!(job.measurement_count(), 0);
}
