//! Job registry and machine telemetry for the oxbench benchmark agent.
//!
//! Jobs are kept in an in-memory [`registry::JobRegistry`]. While a job runs,
//! a [`telemetry::TelemetrySession`] streams machine counters into the job's
//! measurement queue. Job supplied URLs are checked with
//! [`uri::UriValidator`] before anything is fetched.

pub mod config;
pub mod error;
pub mod job;
pub mod registry;
pub mod telemetry;
pub mod uri;
