use crate::error::TelemetryError;
use crate::job::Job;
use crate::telemetry::transport::{DiagnosticTransport, EventStream, StreamError, TransportError};
use oxbench_collector::policy::{select_emitters, EmitterSettings};
use oxbench_collector::{CounterEmitter, CounterSink};
use oxbench_common::types::Measurement;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// Lifecycle of a [`TelemetrySession`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Built,
    Streaming,
    Stopping,
    Stopped,
}

/// How the decode loop finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum StreamOutcome {
    /// The loop never ran.
    NotStarted,
    /// The stream was stopped and closed cleanly.
    Closed,
    /// The stream was read past its end after the traced process exited.
    ExpectedEnd,
    /// Reading failed for another reason.
    Failed(String),
    /// The loop was cancelled after the transport failed to stop and it did
    /// not finish draining in time.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub measurements: u64,
    pub outcome: StreamOutcome,
    pub emitters_disposed: usize,
    pub disposal_failures: usize,
    /// Set when stopping the transport failed for a reason other than the
    /// server already being gone.
    pub stop_error: Option<String>,
}

/// How long a decode loop that can no longer be woken up by the transport
/// may keep draining buffered events before it is aborted.
const STOP_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Streams machine counters into one job's measurement queue.
///
/// A session is built for a job, registers the emitters that apply to it,
/// opens a diagnostic stream and decodes events on a background task until
/// either the stream ends or the job signals that it is ending. Teardown
/// happens exactly once: the stream is stopped, the decode task joined and
/// every emitter disposed.
pub struct TelemetrySession {
    job: Arc<Job>,
    transport: Arc<dyn DiagnosticTransport>,
    sink: CounterSink,
    settings: EmitterSettings,
    target_pid: u32,
    state: SessionState,
    emitters: Vec<Box<dyn CounterEmitter>>,
    stream: Option<Arc<dyn EventStream>>,
    decode_task: Option<JoinHandle<StreamOutcome>>,
    outcome: Option<StreamOutcome>,
    appended: Arc<AtomicU64>,
    emitters_disposed: usize,
    disposal_failures: usize,
    stop_error: Option<String>,
    span: tracing::Span,
}

impl TelemetrySession {
    /// Builds a session tracing the agent's own process, which is where the
    /// emitters publish.
    pub fn new(
        job: Arc<Job>,
        transport: Arc<dyn DiagnosticTransport>,
        sink: CounterSink,
        settings: EmitterSettings,
    ) -> Self {
        let span = tracing::info_span!("telemetry", job_id = job.id(), service = %job.service());
        Self {
            job,
            transport,
            sink,
            settings,
            target_pid: std::process::id(),
            state: SessionState::Built,
            emitters: Vec::new(),
            stream: None,
            decode_task: None,
            outcome: None,
            appended: Arc::new(AtomicU64::new(0)),
            emitters_disposed: 0,
            disposal_failures: 0,
            stop_error: None,
            span,
        }
    }

    pub fn with_target_pid(mut self, pid: u32) -> Self {
        self.target_pid = pid;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn counter_names(&self) -> Vec<&str> {
        self.emitters.iter().map(|e| e.counter_name()).collect()
    }

    /// Registers every emitter the job's operating system and options call
    /// for. Returns the number of emitters registered.
    pub fn register_counters(&mut self) -> usize {
        let mut registered = 0;
        for variant in select_emitters(self.job.operating_system(), self.job.options()) {
            let emitter = variant.build(&self.settings);
            if self.register_emitter(emitter) {
                registered += 1;
            }
        }
        registered
    }

    /// Adds an emitter and records its metadata on the job. Only possible
    /// before streaming starts; duplicate counters are rejected.
    pub fn register_emitter(&mut self, emitter: Box<dyn CounterEmitter>) -> bool {
        if self.state != SessionState::Built {
            tracing::warn!(
                job_id = self.job.id(),
                emitter = emitter.counter_name(),
                state = ?self.state,
                "Emitter registered after the session started, ignoring"
            );
            return false;
        }
        if self.emitters.iter().any(|e| e.counter_name() == emitter.counter_name()) {
            tracing::debug!(job_id = self.job.id(), emitter = emitter.counter_name(), "Emitter already registered");
            return false;
        }

        if !self.job.register_metadata(emitter.metadata()) {
            tracing::debug!(
                job_id = self.job.id(),
                measurement = emitter.measurement_name(),
                "Metadata already present for measurement"
            );
        }
        tracing::info!(
            job_id = self.job.id(),
            emitter = emitter.counter_name(),
            measurement = emitter.measurement_name(),
            "Counter registered"
        );
        self.emitters.push(emitter);
        true
    }

    /// Opens the diagnostic stream, starts the emitters and launches the
    /// decode loop.
    ///
    /// # Errors
    ///
    /// Returns the transport failure if the stream cannot be opened. The
    /// session is then torn down and the job keeps no metadata for it.
    pub async fn start(&mut self) -> Result<(), TelemetryError> {
        if self.state != SessionState::Built {
            return Ok(());
        }

        let providers = vec![self.sink.provider().to_string()];
        let stream = match self.transport.open(self.target_pid, &providers).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = match e {
                    TransportError::ServerNotAvailable => TelemetryError::TransportUnavailable,
                    TransportError::Other(msg) => TelemetryError::Transport(msg),
                };
                tracing::error!(job_id = self.job.id(), pid = self.target_pid, error = %err, "Failed to open diagnostic session");
                let names = self.measurement_names();
                self.job.withdraw_metadata(&names);
                self.stop().await;
                return Err(err);
            }
        };

        let mut started = Vec::with_capacity(self.emitters.len());
        let mut not_started = Vec::new();
        for mut emitter in std::mem::take(&mut self.emitters) {
            match emitter.start(&self.sink) {
                Ok(()) => started.push(emitter),
                Err(e) => {
                    tracing::warn!(job_id = self.job.id(), emitter = emitter.counter_name(), error = %e, "Failed to start emitter");
                    not_started.push(emitter.measurement_name().to_string());
                    self.dispose_emitter(emitter);
                }
            }
        }
        self.emitters = started;
        // Series whose emitter could not start keep no description, unless
        // another running emitter feeds the same measurement.
        not_started.retain(|name| !self.emitters.iter().any(|e| e.measurement_name() == name));
        self.job.withdraw_metadata(&not_started);

        let counters: HashMap<String, String> = self
            .emitters
            .iter()
            .map(|e| (e.counter_name().to_string(), e.measurement_name().to_string()))
            .collect();

        let decode = decode_events(
            Arc::clone(&stream),
            Arc::clone(&self.job),
            self.sink.provider().to_string(),
            counters,
            Arc::clone(&self.appended),
        );
        self.decode_task = Some(tokio::spawn(decode.instrument(self.span.clone())));
        self.stream = Some(stream);
        self.state = SessionState::Streaming;

        tracing::info!(job_id = self.job.id(), emitters = self.emitters.len(), "Telemetry streaming started");
        Ok(())
    }

    /// Streams until the decode loop ends on its own or `stop_signal` is
    /// raised, whichever happens first, then stops the session.
    pub async fn run(&mut self, stop_signal: watch::Receiver<bool>) -> SessionSummary {
        if self.state == SessionState::Streaming {
            if let Some(mut task) = self.decode_task.take() {
                let signalled = tokio::select! {
                    joined = &mut task => {
                        self.outcome = Some(outcome_from_join(joined));
                        false
                    }
                    _ = wait_for_signal(stop_signal.clone()) => true,
                };
                if signalled {
                    self.decode_task = Some(task);
                }
            }

            // Both can hold by now; they are reported independently.
            let stream_ended = self.outcome.is_some()
                || self.decode_task.as_ref().is_some_and(|t| t.is_finished());
            if stream_ended {
                tracing::info!(job_id = self.job.id(), "Reason: the counter stream has ended");
            }
            if *stop_signal.borrow() {
                tracing::info!(job_id = self.job.id(), "Reason: the job's counters are being stopped");
            }
        }

        self.stop().await
    }

    /// Stops the stream, waits for the decode loop and disposes every
    /// emitter. Calling it again after the session stopped is a no-op.
    pub async fn stop(&mut self) -> SessionSummary {
        if self.state == SessionState::Stopped {
            return self.summary();
        }
        self.state = SessionState::Stopping;

        let mut stop_failed = false;
        if let Some(stream) = self.stream.take() {
            match stream.stop().await {
                Ok(()) => tracing::debug!(job_id = self.job.id(), "Diagnostic session stopped"),
                Err(TransportError::ServerNotAvailable) => {
                    stop_failed = true;
                    tracing::info!(
                        job_id = self.job.id(),
                        error = %TelemetryError::TransportUnavailable,
                        "Traced process already exited, treating session as stopped"
                    );
                }
                Err(TransportError::Other(msg)) => {
                    stop_failed = true;
                    let err = TelemetryError::Transport(msg);
                    tracing::error!(job_id = self.job.id(), error = %err, "Failed to stop diagnostic session");
                    self.stop_error = Some(err.to_string());
                }
            }
        }

        if let Some(mut task) = self.decode_task.take() {
            let outcome = if stop_failed {
                // Without a working control channel nothing is left to wake
                // the decode loop up once it has drained what is buffered.
                match tokio::time::timeout(STOP_DRAIN_GRACE, &mut task).await {
                    Ok(joined) => outcome_from_join(joined),
                    Err(_) => {
                        task.abort();
                        outcome_from_join(task.await)
                    }
                }
            } else {
                outcome_from_join(task.await)
            };
            self.outcome = Some(outcome);
        }

        for emitter in std::mem::take(&mut self.emitters) {
            self.dispose_emitter(emitter);
        }

        self.state = SessionState::Stopped;
        let summary = self.summary();
        tracing::info!(
            job_id = self.job.id(),
            measurements = summary.measurements,
            outcome = ?summary.outcome,
            disposed = summary.emitters_disposed,
            disposal_failures = summary.disposal_failures,
            "Telemetry session stopped"
        );
        summary
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            measurements: self.appended.load(Ordering::SeqCst),
            outcome: self.outcome.clone().unwrap_or(StreamOutcome::NotStarted),
            emitters_disposed: self.emitters_disposed,
            disposal_failures: self.disposal_failures,
            stop_error: self.stop_error.clone(),
        }
    }

    fn measurement_names(&self) -> Vec<String> {
        self.emitters
            .iter()
            .map(|e| e.measurement_name().to_string())
            .collect()
    }

    fn dispose_emitter(&mut self, mut emitter: Box<dyn CounterEmitter>) {
        self.emitters_disposed += 1;
        if let Err(source) = emitter.dispose() {
            self.disposal_failures += 1;
            let err = TelemetryError::EmitterDisposal {
                emitter: emitter.counter_name().to_string(),
                source,
            };
            tracing::error!(job_id = self.job.id(), error = %err, "Emitter disposal failed");
        }
    }
}

impl Drop for TelemetrySession {
    fn drop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        if let Some(task) = self.decode_task.take() {
            task.abort();
        }
        for emitter in std::mem::take(&mut self.emitters) {
            self.dispose_emitter(emitter);
        }
        tracing::warn!(job_id = self.job.id(), state = ?self.state, "Telemetry session dropped without being stopped");
    }
}

/// Resolves once the signal is raised. A signal whose sender is gone can
/// never be raised, so it never resolves.
async fn wait_for_signal(mut signal: watch::Receiver<bool>) {
    if signal.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn outcome_from_join(joined: Result<StreamOutcome, JoinError>) -> StreamOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => StreamOutcome::Aborted,
        Err(e) => {
            tracing::error!(error = %e, "Decode loop panicked");
            StreamOutcome::Failed(e.to_string())
        }
    }
}

async fn decode_events(
    stream: Arc<dyn EventStream>,
    job: Arc<Job>,
    provider: String,
    counters: HashMap<String, String>,
    appended: Arc<AtomicU64>,
) -> StreamOutcome {
    loop {
        match stream.next_event().await {
            Ok(Some(event)) => {
                if event.provider != provider {
                    continue;
                }
                let Some(name) = counters.get(&event.counter_name) else {
                    tracing::trace!(counter = %event.counter_name, "Dropping event of unregistered counter");
                    continue;
                };
                job.push_measurement(Measurement::new(name.clone(), event.value, event.timestamp));
                appended.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None) => return StreamOutcome::Closed,
            Err(StreamError::EndOfStream) => {
                tracing::warn!(error = %TelemetryError::ExpectedStreamEnd, "Counter stream ended");
                return StreamOutcome::ExpectedEnd;
            }
            Err(StreamError::Read(msg)) => {
                let err = TelemetryError::UnexpectedStream(msg.clone());
                tracing::error!(error = %err, "Counter stream failed");
                return StreamOutcome::Failed(msg);
            }
        }
    }
}
