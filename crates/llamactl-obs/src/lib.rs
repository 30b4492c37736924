//! Observability utilities: GPU, host and container polling, and
//! Prometheus export of telemetry snapshots.

pub mod host;
pub mod metrics;
pub mod poller;

pub use host::HostSampler;
pub use metrics::TelemetryMetrics;
pub use poller::{PollerSettings, ResourcePoller};
