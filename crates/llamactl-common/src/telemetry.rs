//! Observable facts about the serving host and process.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuMetrics {
    pub index: u32,
    pub name: String,
    pub mem_used_mib: u64,
    pub mem_total_mib: u64,
    pub util_percent: u32,
    pub power_draw_w: u32,
    pub power_limit_w: u32,
    pub temp_c: u32,
}

impl GpuMetrics {
    pub fn mem_percent(&self) -> u32 {
        if self.mem_total_mib == 0 { 0 } else { (self.mem_used_mib * 100 / self.mem_total_mib) as u32 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub cpu_percent: u32,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub mem_total_mib: u64,
    pub mem_used_mib: u64,
    pub swap_total_mib: u64,
    pub swap_used_mib: u64,
}

/// Resource usage as reported by the container tool, kept verbatim.
/// Both fields are empty while the container is not observed running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub cpu_percent_text: String,
    pub mem_usage_text: String,
}

impl ContainerMetrics {
    pub fn is_running(&self) -> bool {
        !self.cpu_percent_text.is_empty() || !self.mem_usage_text.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No confirmed healthy instance.
    #[default]
    Idle,
    /// Start issued, health not yet confirmed.
    Starting,
    /// Last health check succeeded.
    Running,
    /// Shutdown issued, not yet confirmed.
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }

    /// Idle and running are the only states a finished switch may leave behind.
    pub fn is_settled(&self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Running)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveModel {
    pub profile_id: String,
    pub display_name: String,
}
