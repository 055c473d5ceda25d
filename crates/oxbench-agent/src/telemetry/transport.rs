use async_trait::async_trait;
use oxbench_collector::CounterSink;
use oxbench_common::types::CounterEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

/// Failure while reading decoded events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The stream was read past its end, the traced process has exited.
    #[error("attempted to read past the end of the event stream")]
    EndOfStream,

    #[error("event stream read failed: {0}")]
    Read(String),
}

/// Failure of the diagnostic control channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No diagnostic server answers for the process, usually because it
    /// already exited.
    #[error("diagnostic server is not available")]
    ServerNotAvailable,

    #[error("{0}")]
    Other(String),
}

/// A live stream of decoded counter events bound to one traced process.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Waits for the next event. Returns `Ok(None)` once the stream has been
    /// stopped; a pending call is woken up by [`EventStream::stop`].
    async fn next_event(&self) -> Result<Option<CounterEvent>, StreamError>;

    /// Stops the underlying session.
    async fn stop(&self) -> Result<(), TransportError>;
}

/// Opens diagnostic sessions against processes.
#[async_trait]
pub trait DiagnosticTransport: Send + Sync {
    async fn open(&self, pid: u32, providers: &[String]) -> Result<Arc<dyn EventStream>, TransportError>;
}

/// Transport tracing the agent's own process, where the counter emitters
/// publish into a [`CounterSink`].
pub struct InProcessTransport {
    sink: CounterSink,
}

impl InProcessTransport {
    pub fn new(sink: CounterSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl DiagnosticTransport for InProcessTransport {
    async fn open(&self, pid: u32, providers: &[String]) -> Result<Arc<dyn EventStream>, TransportError> {
        if pid != std::process::id() {
            return Err(TransportError::ServerNotAvailable);
        }
        if !providers.iter().any(|p| p == self.sink.provider()) {
            tracing::warn!(
                provider = self.sink.provider(),
                ?providers,
                "In-process source is not among the requested providers"
            );
        }

        let (stopped, _) = watch::channel(false);
        let stream: Arc<dyn EventStream> = Arc::new(InProcessStream {
            receiver: Mutex::new(self.sink.subscribe()),
            stopped,
        });
        Ok(stream)
    }
}

struct InProcessStream {
    receiver: Mutex<broadcast::Receiver<CounterEvent>>,
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl EventStream for InProcessStream {
    async fn next_event(&self) -> Result<Option<CounterEvent>, StreamError> {
        let mut stopped = self.stopped.subscribe();
        let mut receiver = self.receiver.lock().await;

        loop {
            if *stopped.borrow_and_update() {
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = stopped.changed() => continue,
                received = receiver.recv() => match received {
                    Ok(event) => return Ok(Some(event)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged, counter values were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(StreamError::EndOfStream),
                },
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.stopped.send_replace(true);
        Ok(())
    }
}
