//! Machine telemetry collected while a job runs.
//!
//! A [`session::TelemetrySession`] owns the diagnostic stream and the counter
//! emitters of one job. The stream itself sits behind
//! [`transport::DiagnosticTransport`] so the tracing mechanism can be swapped.

pub mod session;
pub mod transport;


pub use session::{SessionState, SessionSummary, StreamOutcome, TelemetrySession};
pub use transport::{DiagnosticTransport, EventStream, InProcessTransport, StreamError, TransportError};
