use crate::windows::machine_cpu_metadata;
use crate::{current_runtime, CounterEmitter, CounterSink, SamplingTask, MACHINE_CPU_MEASUREMENT};
use anyhow::{Context, Result};
use oxbench_common::types::{MeasurementMetadata, OperatingSystem};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// External tool that prints periodic CPU reports with an idle column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingTool {
    /// `vmstat -n <secs>` on Linux.
    Vmstat,
    /// `iostat -w <secs>` on macOS.
    Iostat,
}

impl SamplingTool {
    pub fn for_os(os: OperatingSystem) -> Self {
        match os {
            OperatingSystem::MacOs => SamplingTool::Iostat,
            _ => SamplingTool::Vmstat,
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            SamplingTool::Vmstat => "vmstat",
            SamplingTool::Iostat => "iostat",
        }
    }

    pub fn counter_name(&self) -> &'static str {
        match self {
            SamplingTool::Vmstat => "vmstat-cpu",
            SamplingTool::Iostat => "iostat-cpu",
        }
    }

    /// Report interval arguments. The tools take whole seconds, so the
    /// interval is rounded up.
    pub fn args(&self, interval: Duration) -> Vec<String> {
        let secs = (interval.as_secs_f64().ceil() as u64).max(1).to_string();
        match self {
            SamplingTool::Vmstat => vec!["-n".to_string(), secs],
            SamplingTool::Iostat => vec!["-w".to_string(), secs],
        }
    }
}

/// Turns the text reports of a [`SamplingTool`] into CPU usage percentages.
///
/// The header row naming an `id` column fixes the idle column and the row
/// width. The first numeric row after it averages since boot and is skipped.
#[derive(Debug, Default)]
pub struct IdleColumnParser {
    idle_column: Option<usize>,
    width: usize,
    skipped_boot_report: bool,
}

impl IdleColumnParser {
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            return None;
        }

        if let Some(idx) = fields.iter().position(|f| *f == "id") {
            if self.idle_column != Some(idx) || self.width != fields.len() {
                self.idle_column = Some(idx);
                self.width = fields.len();
                self.skipped_boot_report = false;
            }
            return None;
        }

        let idx = self.idle_column?;
        if fields.len() != self.width {
            return None;
        }
        let idle: f64 = fields.get(idx)?.parse().ok()?;
        if fields.iter().any(|f| f.parse::<f64>().is_err()) {
            return None;
        }
        if !self.skipped_boot_report {
            self.skipped_boot_report = true;
            return None;
        }

        Some((100.0 - idle).clamp(0.0, 100.0))
    }
}

/// Machine wide CPU usage on Linux and macOS, read from a sampling tool.
pub struct SampledMachineCpuEmitter {
    tool: SamplingTool,
    program: String,
    interval: Duration,
    task: SamplingTask,
}

impl SampledMachineCpuEmitter {
    pub fn new(tool: SamplingTool, interval: Duration) -> Self {
        Self {
            tool,
            program: tool.program().to_string(),
            interval,
            task: SamplingTask::default(),
        }
    }

    /// Runs `program` instead of the tool's default executable, e.g. a
    /// binary outside `PATH`. It must speak the tool's arguments and output.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn tool(&self) -> SamplingTool {
        self.tool
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl CounterEmitter for SampledMachineCpuEmitter {
    fn counter_name(&self) -> &str {
        self.tool.counter_name()
    }

    fn measurement_name(&self) -> &str {
        MACHINE_CPU_MEASUREMENT
    }

    fn metadata(&self) -> MeasurementMetadata {
        machine_cpu_metadata()
    }

    fn start(&mut self, sink: &CounterSink) -> Result<()> {
        if self.task.is_running() {
            return Ok(());
        }
        // The child's pipes register with the runtime's reactor.
        current_runtime()?;

        let mut child = Command::new(&self.program)
            .args(self.tool.args(self.interval))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{} has no stdout", self.program))?;

        let tool = self.tool;
        let program = self.program.clone();
        let sink = sink.clone();
        self.task.spawn(async move {
            if let Err(e) = read_reports(tool, child, stdout, &sink).await {
                tracing::error!(tool = %program, error = %e, "Sampling tool failed");
            }
        })
    }

    fn dispose(&mut self) -> Result<()> {
        // Aborting drops the child handle, which kills the tool.
        self.task.abort();
        Ok(())
    }
}

async fn read_reports(tool: SamplingTool, mut child: Child, stdout: ChildStdout, sink: &CounterSink) -> Result<()> {
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = IdleColumnParser::default();
    let mut published = 0u64;

    while let Some(line) = lines.next_line().await? {
        if let Some(cpu) = parser.feed(&line) {
            sink.publish(tool.counter_name(), cpu);
            published += 1;
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        anyhow::bail!("exited with {status} after {published} reports");
    }
    tracing::debug!(tool = tool.program(), %status, published, "Sampling tool exited");
    Ok(())
}
