/// Errors surfaced to callers of the agent library.
///
/// # Examples
///
/// ```rust
/// use oxbench_agent::error::AgentError;
///
/// let err = AgentError::InvalidArgument("job id must be 0".to_string());
/// assert!(err.to_string().contains("job id must be 0"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The caller passed a value the operation cannot accept, e.g. a job
    /// that already carries an id.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A job supplied URL failed scheme or domain validation.
    #[error("Rejected URI '{uri}': not an allowed http(s) location")]
    RejectedUri { uri: String },
}

/// Convenience `Result` alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Failures inside a telemetry session. None of these reach the caller of
/// the session; they are classified and logged.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The event stream was read past its end because the traced process
    /// already exited.
    #[error("Telemetry: event stream ended, the traced process has exited")]
    ExpectedStreamEnd,

    /// Any other failure while reading the event stream.
    #[error("Telemetry: unexpected event stream failure: {0}")]
    UnexpectedStream(String),

    /// The control channel of the diagnostic session is already gone.
    #[error("Telemetry: diagnostic server is not available")]
    TransportUnavailable,

    /// The diagnostic transport failed for another reason.
    #[error("Telemetry: diagnostic transport error: {0}")]
    Transport(String),

    /// An emitter failed to release its resources.
    #[error("Telemetry: failed to dispose emitter '{emitter}': {source}")]
    EmitterDisposal {
        emitter: String,
        source: anyhow::Error,
    },
}
