//! GPU metrics from `nvidia-smi`, or from NVML directly with the `nvidia` feature.

use std::process::Stdio;

use async_trait::async_trait;
use llamactl_backend::GpuSource;
use llamactl_common::GpuMetrics;
use tokio::process::Command;

const QUERY: &str = "--query-gpu=index,name,memory.used,memory.total,utilization.gpu,power.draw,power.limit,temperature.gpu";

#[derive(Debug, Clone, Default)]
pub struct NvidiaSmi;

impl NvidiaSmi {
    pub fn new() -> Self { Self }
}

#[async_trait]
impl GpuSource for NvidiaSmi {
    async fn query(&self) -> Vec<GpuMetrics> {
        let output = Command::new("nvidia-smi")
            .args([QUERY, "--format=csv,noheader,nounits"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => parse_gpu_csv(&String::from_utf8_lossy(&out.stdout)),
            // absent tool or no driver: no GPU data
            _ => Vec::new(),
        }
    }
}

/// Parses one `nvidia-smi` CSV record per line. Records with missing or
/// non-numeric fields are skipped; `[N/A]` readings count as zero.
pub fn parse_gpu_csv(text: &str) -> Vec<GpuMetrics> {
    text.lines().filter_map(parse_gpu_line).collect()
}

fn parse_gpu_line(line: &str) -> Option<GpuMetrics> {
    if line.trim().is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 8 {
        return None;
    }
    Some(GpuMetrics {
        index: parts[0].parse().ok()?,
        name: parts[1].to_string(),
        mem_used_mib: reading(parts[2])? as u64,
        mem_total_mib: reading(parts[3])? as u64,
        util_percent: reading(parts[4])? as u32,
        power_draw_w: reading(parts[5])? as u32,
        power_limit_w: reading(parts[6])? as u32,
        temp_c: reading(parts[7])? as u32,
    })
}

fn reading(field: &str) -> Option<f64> {
    if field.contains("N/A") {
        return Some(0.0);
    }
    field.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(feature = "nvidia")]
pub struct NvmlGpu {
    nvml: nvml_wrapper::Nvml,
}

#[cfg(feature = "nvidia")]
impl NvmlGpu {
    pub fn init() -> Option<Self> {
        match nvml_wrapper::Nvml::init() {
            Ok(nvml) => Some(Self { nvml }),
            Err(e) => {
                tracing::warn!(target: "poller", "NVML unavailable: {}", e);
                None
            }
        }
    }

    fn read_all(&self) -> Vec<GpuMetrics> {
        use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
        let Ok(count) = self.nvml.device_count() else { return Vec::new() };
        (0..count)
            .filter_map(|i| {
                let device = self.nvml.device_by_index(i).ok()?;
                let mem = device.memory_info().ok()?;
                Some(GpuMetrics {
                    index: i,
                    name: device.name().unwrap_or_default(),
                    mem_used_mib: mem.used / 1024 / 1024,
                    mem_total_mib: mem.total / 1024 / 1024,
                    util_percent: device.utilization_rates().map(|u| u.gpu).unwrap_or(0),
                    power_draw_w: device.power_usage().map(|mw| mw / 1000).unwrap_or(0),
                    power_limit_w: device.enforced_power_limit().map(|mw| mw / 1000).unwrap_or(0),
                    temp_c: device.temperature(TemperatureSensor::Gpu).unwrap_or(0),
                })
            })
            .collect()
    }
}

#[cfg(feature = "nvidia")]
#[async_trait]
impl GpuSource for NvmlGpu {
    async fn query(&self) -> Vec<GpuMetrics> {
        // NVML calls are synchronous but return in microseconds
        self.read_all()
    }
}
