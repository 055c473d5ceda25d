use anyhow::{anyhow, bail, Context, Result};
use oxbench_agent::config::AgentConfig;
use oxbench_agent::job::{Job, JobDefinition};
use oxbench_agent::registry::JobRegistry;
use oxbench_agent::telemetry::{InProcessTransport, SessionSummary, TelemetrySession};
use oxbench_agent::uri::UriValidator;
use oxbench_collector::CounterSink;
use oxbench_common::types::{Measurement, MeasurementMetadata, OperatingSystem};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tokio::signal;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

#[derive(Serialize)]
struct JobSummary<'a> {
    id: u64,
    service: &'a str,
    operating_system: OperatingSystem,
    exit_code: Option<i32>,
}

#[derive(Serialize)]
struct JobReport<'a> {
    job: JobSummary<'a>,
    telemetry: SessionSummary,
    metadata: Vec<MeasurementMetadata>,
    measurements: Vec<Measurement>,
}

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage: oxbench-agent [config.toml] run <job.toml>");
}

/// Splits `[config] run <job>` into its two paths.
fn parse_args(args: &[String]) -> Result<(Option<&str>, &str)> {
    let run = args
        .iter()
        .position(|a| a == "run")
        .ok_or_else(|| anyhow!("missing 'run' command"))?;
    let config = match run {
        0 => None,
        1 => Some(args[0].as_str()),
        _ => bail!("unexpected arguments before 'run'"),
    };
    let job = args
        .get(run + 1)
        .ok_or_else(|| anyhow!("missing job file after 'run'"))?;
    if args.len() > run + 2 {
        bail!("unexpected arguments after job file");
    }
    Ok((config, job.as_str()))
}

fn load_config(path: Option<&str>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => AgentConfig::load(DEFAULT_CONFIG_PATH),
        None => {
            tracing::info!(path = DEFAULT_CONFIG_PATH, "No agent config found, using defaults");
            Ok(AgentConfig::default())
        }
    }
}

/// Runs the benchmark process to completion or until Ctrl-C.
async fn run_process(job: &Job) -> Result<Option<i32>> {
    let executable = job
        .executable()
        .ok_or_else(|| anyhow!("job '{}' has no executable", job.service()))?;

    let mut child = Command::new(executable)
        .args(job.arguments())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {executable}"))?;
    tracing::info!(job_id = job.id(), executable, pid = child.id(), "Benchmark started");

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            tracing::info!(job_id = job.id(), %status, "Benchmark exited");
            Ok(status.code())
        }
        _ = signal::ctrl_c() => {
            tracing::info!(job_id = job.id(), "Interrupted, stopping benchmark");
            child.kill().await?;
            Ok(None)
        }
    }
}

async fn run_job(config_path: Option<&str>, job_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(agent = %config.agent_name, "oxbench-agent starting");

    let registry = JobRegistry::with_allowed_domains(config.allowed_domains.clone());
    let validator = UriValidator::new(registry.allowed_domains());

    let definition = JobDefinition::load(job_path)?;
    definition.validate_attachments(&validator)?;
    let job = registry.add(Job::from_definition(definition))?;

    let sink = CounterSink::new(config.telemetry.provider.as_str(), config.telemetry.event_buffer);
    let transport = Arc::new(InProcessTransport::new(sink.clone()));
    let mut session = TelemetrySession::new(
        Arc::clone(&job),
        transport,
        sink,
        config.telemetry.emitter_settings(),
    );
    session.register_counters();
    if let Err(e) = session.start().await {
        tracing::warn!(job_id = job.id(), error = %e, "Running without telemetry");
    }
    let ending = job.ending_signal();
    let telemetry = tokio::spawn(async move { session.run(ending).await });

    let exit_code = run_process(&job).await;

    registry.remove(job.id());
    let summary = telemetry.await.context("Telemetry task failed")?;
    let exit_code = exit_code?;

    let report = JobReport {
        job: JobSummary {
            id: job.id(),
            service: job.service(),
            operating_system: job.operating_system(),
            exit_code,
        },
        telemetry: summary,
        metadata: job.metadata(),
        measurements: job.drain_measurements(),
    };
    print_report(&report)
}

#[allow(clippy::print_stdout)]
fn print_report(report: &JobReport<'_>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("oxbench=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_usage();
        return Ok(());
    }

    let (config_path, job_path) = match parse_args(&args) {
        Ok(paths) => paths,
        Err(e) => {
            print_usage();
            return Err(e);
        }
    };
    run_job(config_path, job_path).await
}
