use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{ControlError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub compose_file: PathBuf,
    /// Env file read by the compose file; rewritten on every switch.
    pub env_file: Option<PathBuf>,
    pub service_name: String,
    pub profiles_file: PathBuf,
    pub model_dir: PathBuf,
    pub health_url: String,
    pub api_addr: SocketAddr,
    pub poll_interval_ms: u64,
    pub health_poll_interval_ms: u64,
    pub health_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub switch_wait_secs: u64,
    pub log_capacity: usize,
    pub log_tail: usize,
    pub stats_timeout_secs: u64,
    pub gpu_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            compose_file: PathBuf::from("docker-compose.yml"),
            env_file: None,
            service_name: String::from("llama-server"),
            profiles_file: PathBuf::from("profiles.yaml"),
            model_dir: PathBuf::from("models"),
            health_url: String::from("http://127.0.0.1:8080/health"),
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            poll_interval_ms: 2000,
            health_poll_interval_ms: 2000,
            health_timeout_secs: 300,
            command_timeout_secs: 60,
            switch_wait_secs: 300,
            log_capacity: 2000,
            log_tail: 200,
            stats_timeout_secs: 10,
            gpu_timeout_secs: 5,
        }
    }
}

impl ControlConfig {
    /// Loads from the YAML file named by `LLAMACTL_CONFIG`, or from defaults
    /// overridden by `LLAMACTL_*` variables.
    pub fn load() -> Result<Self> {
        let cfg = if let Ok(path) = env::var("LLAMACTL_CONFIG") {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ControlError::Config(format!("cannot read {path}: {e}")))?;
            Self::from_yaml(&text)?
        } else {
            let mut cfg = Self::default();
            cfg.apply_env();
            cfg
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| ControlError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("LLAMACTL_COMPOSE_FILE") { self.compose_file = PathBuf::from(v); }
        if let Ok(v) = env::var("LLAMACTL_ENV_FILE") { self.env_file = Some(PathBuf::from(v)); }
        if let Ok(v) = env::var("LLAMACTL_SERVICE") { self.service_name = v; }
        if let Ok(v) = env::var("LLAMACTL_PROFILES") { self.profiles_file = PathBuf::from(v); }
        if let Ok(v) = env::var("LLAMACTL_MODEL_DIR") { self.model_dir = PathBuf::from(v); }
        if let Ok(v) = env::var("LLAMACTL_HEALTH_URL") { self.health_url = v; }
        if let Some(v) = env::var("LLAMACTL_API_ADDR").ok().and_then(|v| v.parse().ok()) { self.api_addr = v; }
        if let Some(v) = env::var("LLAMACTL_POLL_MS").ok().and_then(|v| v.parse().ok()) { self.poll_interval_ms = v; }
        if let Some(v) = env::var("LLAMACTL_HEALTH_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()) { self.health_timeout_secs = v; }
        if let Some(v) = env::var("LLAMACTL_LOG_CAPACITY").ok().and_then(|v| v.parse().ok()) { self.log_capacity = v; }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_addr.ip().is_loopback() {
            return Err(ControlError::Config(format!(
                "api_addr {} is not a loopback address",
                self.api_addr
            )));
        }
        if self.log_capacity == 0 {
            return Err(ControlError::Config("log_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// The env file defaults to `.env` beside the compose file.
    pub fn env_file_path(&self) -> PathBuf {
        match &self.env_file {
            Some(p) => p.clone(),
            None => self
                .compose_file
                .parent()
                .map(|dir| dir.join(".env"))
                .unwrap_or_else(|| PathBuf::from(".env")),
        }
    }

    pub fn poll_interval(&self) -> Duration { Duration::from_millis(self.poll_interval_ms) }
    pub fn health_poll_interval(&self) -> Duration { Duration::from_millis(self.health_poll_interval_ms) }
    pub fn health_timeout(&self) -> Duration { Duration::from_secs(self.health_timeout_secs) }
    pub fn command_timeout(&self) -> Duration { Duration::from_secs(self.command_timeout_secs) }
    pub fn switch_wait(&self) -> Duration { Duration::from_secs(self.switch_wait_secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_only_named_fields() {
        let cfg = ControlConfig::from_yaml("service_name: vllm\nhealth_timeout_secs: 30\n").unwrap();
        assert_eq!(cfg.service_name, "vllm");
        assert_eq!(cfg.health_timeout_secs, 30);
        assert_eq!(cfg.log_capacity, 2000);
    }

    #[test]
    fn rejects_non_loopback_api() {
        let cfg = ControlConfig::from_yaml("api_addr: 0.0.0.0:8081\n").unwrap();
        assert!(matches!(cfg.validate(), Err(ControlError::Config(_))));
    }

    #[test]
    fn env_file_sits_next_to_compose_file() {
        let cfg = ControlConfig::from_yaml("compose_file: /srv/llama/docker-compose.yml\n").unwrap();
        assert_eq!(cfg.env_file_path(), PathBuf::from("/srv/llama/.env"));
    }
}
