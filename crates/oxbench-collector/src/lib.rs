//! Counter emitters for the oxbench agent.
//!
//! Each [`CounterEmitter`] samples one metric series from a platform specific
//! source (CPU counters, an external sampling tool, a single process) and
//! publishes it as [`CounterEvent`]s through a [`CounterSink`]. Which
//! emitters apply to a job is decided in one place, [`policy::select_emitters`].

pub mod policy;
pub mod sampled;
pub mod windows;


use anyhow::Result;
use chrono::Utc;
use oxbench_common::types::{CounterEvent, MeasurementMetadata};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Measurement name of the machine wide CPU series.
pub const MACHINE_CPU_MEASUREMENT: &str = "machine/cpu";

/// Measurement name of the `lsass` process CPU series.
pub const LSASS_CPU_MEASUREMENT: &str = "machine/cpu/lsass";

/// A capability producing values for a single metric series.
///
/// Emitters are built by the registration policy, started once and disposed
/// exactly once by the owning telemetry session. Both `start` and `dispose`
/// must tolerate being called again.
pub trait CounterEmitter: Send + Sync {
    /// Identifier of the underlying source, carried by every published event.
    fn counter_name(&self) -> &str;

    /// Logical metric name used for the emitted measurements.
    fn measurement_name(&self) -> &str;

    /// Description of the series, registered before the first value.
    fn metadata(&self) -> MeasurementMetadata;

    /// Begins sampling into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling cannot be started, e.g. outside a tokio
    /// runtime.
    fn start(&mut self, sink: &CounterSink) -> Result<()>;

    /// Stops sampling and releases any OS handle.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource could not be released.
    fn dispose(&mut self) -> Result<()>;
}

/// Publishing end of an in-process counter event source.
///
/// Every published value is stamped with the sink's provider name and the
/// current UTC time, then fanned out to all subscribed readers.
#[derive(Clone)]
pub struct CounterSink {
    provider: Arc<str>,
    sender: broadcast::Sender<CounterEvent>,
}

impl CounterSink {
    pub fn new(provider: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            provider: Arc::from(provider.into()),
            sender,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Publishes a value. Returns `false` when nobody is listening.
    pub fn publish(&self, counter_name: &str, value: f64) -> bool {
        let event = CounterEvent {
            provider: self.provider.to_string(),
            counter_name: counter_name.to_string(),
            value,
            timestamp: Utc::now(),
        };
        self.sender.send(event).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CounterEvent> {
        self.sender.subscribe()
    }
}

/// Handle on the background task an emitter samples from.
#[derive(Default)]
pub struct SamplingTask {
    handle: Option<JoinHandle<()>>,
}

impl SamplingTask {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawns `sampler` on the current tokio runtime unless a sampler is
    /// already running.
    pub fn spawn<F>(&mut self, sampler: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_running() {
            return Ok(());
        }
        self.handle = Some(current_runtime()?.spawn(sampler));
        Ok(())
    }

    /// Aborts the sampler. Returns `false` if nothing was running.
    pub fn abort(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for SamplingTask {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Handle of the runtime the calling emitter runs on.
pub(crate) fn current_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|e| anyhow::anyhow!("counter sampling requires a tokio runtime: {e}"))
}

/// Calls `probe` every `interval` and publishes whatever it returns.
///
/// The first tick is consumed before sampling so that rate based probes
/// (CPU usage) have a baseline.
pub(crate) async fn poll_counter<P>(sink: CounterSink, counter_name: String, interval: Duration, mut probe: P)
where
    P: FnMut() -> Option<f64> + Send,
{
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await;

    loop {
        tick.tick().await;
        match probe() {
            Some(value) => {
                if !sink.publish(&counter_name, value) {
                    tracing::trace!(counter = %counter_name, "No subscriber for counter value");
                }
            }
            None => tracing::debug!(counter = %counter_name, "Counter produced no value"),
        }
    }
}
