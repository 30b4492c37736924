//! Shared types for the llamactl control plane: errors, configuration,
//! model profiles and telemetry records.

pub mod config;
pub mod profile;
pub mod telemetry;

pub use config::ControlConfig;
pub use profile::{ModelProfile, ProfileSet};
pub use telemetry::{ActiveModel, ContainerMetrics, GpuMetrics, HostMetrics, LifecycleState};

use std::time::Duration;

pub type Result<T> = core::result::Result<T, ControlError>;

#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
    #[error("a model switch is already in progress")]
    AlreadySwitching,
    #[error("model file not found: {0}")]
    ArtifactMissing(String),
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("`{what}` timed out after {limit:?}")]
    Timeout { what: String, limit: Duration },
    #[error("server did not become healthy within {0:?}")]
    HealthTimeout(Duration),
    #[error("control plane is shutting down")]
    ShuttingDown,
    #[error("switch task aborted: {0}")]
    Internal(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ControlError {
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command { command: command.into(), message: message.into() }
    }

    /// True for both a bounded external command running out of time and the
    /// health wait exhausting its budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::HealthTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_classified() {
        assert!(ControlError::HealthTimeout(Duration::from_secs(300)).is_timeout());
        assert!(ControlError::Timeout { what: "docker compose stop".into(), limit: Duration::from_secs(60) }.is_timeout());
        assert!(!ControlError::command("docker compose up", "exit status 1").is_timeout());
        assert!(!ControlError::ArtifactMissing("a.gguf".into()).is_timeout());
    }

    #[test]
    fn sub_second_limits_are_reported_exactly() {
        let err = ControlError::Timeout { what: "docker compose up".into(), limit: Duration::from_millis(250) };
        assert_eq!(err.to_string(), "`docker compose up` timed out after 250ms");
        let err = ControlError::HealthTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "server did not become healthy within 1.5s");
    }

    #[test]
    fn messages_name_the_cause() {
        let msg = ControlError::ProfileNotFound("qwen".into()).to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("qwen"));
    }
}
