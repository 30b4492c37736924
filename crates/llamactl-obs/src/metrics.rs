//! Prometheus view of the telemetry store.

use llamactl_common::LifecycleState;
use llamactl_core::TelemetrySnapshot;
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

const STATES: [LifecycleState; 4] =
    [LifecycleState::Idle, LifecycleState::Starting, LifecycleState::Running, LifecycleState::Stopping];

/// Gauges on a private registry, refreshed from a snapshot on each scrape.
pub struct TelemetryMetrics {
    registry: Registry,
    gpu_util: GaugeVec,
    gpu_mem_used: IntGaugeVec,
    gpu_mem_total: IntGaugeVec,
    gpu_temp: GaugeVec,
    gpu_power: GaugeVec,
    host_cpu: Gauge,
    host_load: GaugeVec,
    host_mem_used: IntGauge,
    host_mem_total: IntGauge,
    host_swap_used: IntGauge,
    lifecycle: IntGaugeVec,
    log_lines: IntGauge,
}

impl TelemetryMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("llamactl".into()), None)?;
        let gpu = |name: &str, help: &str| GaugeVec::new(Opts::new(name, help), &["gpu", "name"]);
        let gpu_int = |name: &str, help: &str| IntGaugeVec::new(Opts::new(name, help), &["gpu", "name"]);

        let m = Self {
            gpu_util: gpu("gpu_utilization_percent", "GPU utilization percent")?,
            gpu_mem_used: gpu_int("gpu_memory_used_mib", "GPU memory used (MiB)")?,
            gpu_mem_total: gpu_int("gpu_memory_total_mib", "GPU memory total (MiB)")?,
            gpu_temp: gpu("gpu_temperature_celsius", "GPU temperature in C")?,
            gpu_power: gpu("gpu_power_draw_watts", "GPU power draw (W)")?,
            host_cpu: Gauge::new("host_cpu_percent", "Host CPU utilization percent")?,
            host_load: GaugeVec::new(Opts::new("host_load_average", "Host load average"), &["window"])?,
            host_mem_used: IntGauge::new("host_memory_used_mib", "Host memory used (MiB)")?,
            host_mem_total: IntGauge::new("host_memory_total_mib", "Host memory total (MiB)")?,
            host_swap_used: IntGauge::new("host_swap_used_mib", "Host swap used (MiB)")?,
            lifecycle: IntGaugeVec::new(Opts::new("lifecycle_state", "1 for the current lifecycle state"), &["state"])?,
            log_lines: IntGauge::new("log_buffer_lines", "Lines held in the log buffer")?,
            registry,
        };
        m.registry.register(Box::new(m.gpu_util.clone()))?;
        m.registry.register(Box::new(m.gpu_mem_used.clone()))?;
        m.registry.register(Box::new(m.gpu_mem_total.clone()))?;
        m.registry.register(Box::new(m.gpu_temp.clone()))?;
        m.registry.register(Box::new(m.gpu_power.clone()))?;
        m.registry.register(Box::new(m.host_cpu.clone()))?;
        m.registry.register(Box::new(m.host_load.clone()))?;
        m.registry.register(Box::new(m.host_mem_used.clone()))?;
        m.registry.register(Box::new(m.host_mem_total.clone()))?;
        m.registry.register(Box::new(m.host_swap_used.clone()))?;
        m.registry.register(Box::new(m.lifecycle.clone()))?;
        m.registry.register(Box::new(m.log_lines.clone()))?;
        Ok(m)
    }

    pub fn observe(&self, snap: &TelemetrySnapshot) {
        // devices absent from the snapshot must not linger
        self.gpu_util.reset();
        self.gpu_mem_used.reset();
        self.gpu_mem_total.reset();
        self.gpu_temp.reset();
        self.gpu_power.reset();
        for g in &snap.gpus {
            let index = g.index.to_string();
            let labels = [index.as_str(), g.name.as_str()];
            self.gpu_util.with_label_values(&labels).set(g.util_percent as f64);
            self.gpu_mem_used.with_label_values(&labels).set(g.mem_used_mib as i64);
            self.gpu_mem_total.with_label_values(&labels).set(g.mem_total_mib as i64);
            self.gpu_temp.with_label_values(&labels).set(g.temp_c as f64);
            self.gpu_power.with_label_values(&labels).set(g.power_draw_w as f64);
        }

        let host = &snap.host;
        self.host_cpu.set(host.cpu_percent as f64);
        self.host_load.with_label_values(&["1m"]).set(host.load_avg_1);
        self.host_load.with_label_values(&["5m"]).set(host.load_avg_5);
        self.host_load.with_label_values(&["15m"]).set(host.load_avg_15);
        self.host_mem_used.set(host.mem_used_mib as i64);
        self.host_mem_total.set(host.mem_total_mib as i64);
        self.host_swap_used.set(host.swap_used_mib as i64);

        for state in STATES {
            self.lifecycle.with_label_values(&[state.as_str()]).set(i64::from(state == snap.state));
        }
        self.log_lines.set(snap.log_lines.len() as i64);
    }

    /// Text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamactl_common::GpuMetrics;

    #[test]
    fn exports_current_state_and_devices() {
        let metrics = TelemetryMetrics::new().unwrap();
        let mut snap = TelemetrySnapshot {
            state: LifecycleState::Running,
            gpus: vec![GpuMetrics { index: 0, name: "A100".into(), util_percent: 87, ..Default::default() }],
            ..Default::default()
        };
        metrics.observe(&snap);
        let text = metrics.encode().unwrap();
        assert!(text.contains("llamactl_lifecycle_state{state=\"running\"} 1"));
        assert!(text.contains("llamactl_lifecycle_state{state=\"idle\"} 0"));
        assert!(text.contains("llamactl_gpu_utilization_percent{gpu=\"0\",name=\"A100\"} 87"));

        snap.gpus.clear();
        metrics.observe(&snap);
        assert!(!metrics.encode().unwrap().contains("A100"));
    }

    #[test]
    fn instances_do_not_collide() {
        assert!(TelemetryMetrics::new().is_ok());
        assert!(TelemetryMetrics::new().is_ok());
    }
}
