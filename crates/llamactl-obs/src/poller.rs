//! Periodic GPU, host and container sampling into the telemetry store.

use std::sync::Arc;
use std::time::Duration;

use llamactl_backend::{ContainerRuntime, GpuSource};
use llamactl_common::ControlConfig;
use llamactl_core::TelemetryStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::host::HostSampler;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    pub gpu_timeout: Duration,
    pub stats_timeout: Duration,
}

impl PollerSettings {
    pub fn from_config(cfg: &ControlConfig) -> Self {
        Self {
            interval: cfg.poll_interval(),
            gpu_timeout: Duration::from_secs(cfg.gpu_timeout_secs),
            stats_timeout: Duration::from_secs(cfg.stats_timeout_secs),
        }
    }
}

pub struct ResourcePoller {
    store: Arc<TelemetryStore>,
    runtime: Arc<dyn ContainerRuntime>,
    gpu: Arc<dyn GpuSource>,
    host: HostSampler,
    settings: PollerSettings,
}

impl ResourcePoller {
    pub fn new(
        store: Arc<TelemetryStore>,
        runtime: Arc<dyn ContainerRuntime>,
        gpu: Arc<dyn GpuSource>,
        settings: PollerSettings,
    ) -> Self {
        Self { store, runtime, gpu, host: HostSampler::new(), settings }
    }

    pub fn with_host_sampler(mut self, host: HostSampler) -> Self {
        self.host = host;
        self
    }

    /// One sampling pass. Sources are independent: a slow or absent one
    /// yields empty data for its own record only.
    pub async fn poll_once(&mut self) {
        let gpus = match tokio::time::timeout(self.settings.gpu_timeout, self.gpu.query()).await {
            Ok(gpus) => gpus,
            Err(_) => {
                tracing::debug!(target: "poller", "gpu query timed out");
                Vec::new()
            }
        };
        self.store.replace_gpu_metrics(gpus);

        let host = self.host.sample().await;
        self.store.replace_host_metrics(host);

        let container = tokio::time::timeout(self.settings.stats_timeout, self.runtime.stats())
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        self.store.replace_container_metrics(container);
    }

    /// Polls until `shutdown` is cancelled. Cancellation is observed during
    /// the sleep, so the loop exits within one poll of the signal.
    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(target: "poller", interval_ms = self.settings.interval.as_millis() as u64, "resource poller started");
            loop {
                self.poll_once().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.interval) => {}
                }
            }
            tracing::info!(target: "poller", "resource poller stopped");
        })
    }
}
