//! Seams to the external collaborators of the control plane: the container
//! tool driving the serving process, its health endpoint, and the GPU query.

use std::pin::Pin;

use async_trait::async_trait;
use llamactl_common::{ContainerMetrics, GpuMetrics, Result};
use tokio_stream::Stream;

/// Combined stdout/stderr of the serving process, one line per item.
/// Dropping the stream detaches from (and terminates) the follower.
pub type LogStream = Pin<Box<dyn Stream<Item = std::io::Result<String>> + Send>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Stops the serving process. Callers bound this with their own timeout.
    async fn stop(&self) -> Result<()>;
    /// Starts the serving process with the current env file.
    async fn start(&self) -> Result<()>;
    async fn follow_logs(&self) -> Result<LogStream>;
    /// `None` when the process is not observed running.
    async fn stats(&self) -> Option<ContainerMetrics>;
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

#[async_trait]
pub trait GpuSource: Send + Sync {
    /// Empty when no GPU data is available; never an error.
    async fn query(&self) -> Vec<GpuMetrics>;
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;
    use llamactl_common::ControlError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scriptable runtime that records every command it receives.
    #[derive(Default)]
    pub struct MockRuntime {
        calls: Mutex<Vec<&'static str>>,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
        start_delay: Mutex<Duration>,
        stop_delay: Mutex<Duration>,
        log_lines: Mutex<Vec<String>>,
        stats: Mutex<Option<ContainerMetrics>>,
    }

    impl MockRuntime {
        pub fn new() -> Self { Self::default() }

        pub fn calls(&self) -> Vec<&'static str> { self.calls.lock().unwrap().clone() }
        pub fn count(&self, call: &str) -> usize { self.calls().iter().filter(|c| **c == call).count() }
        pub fn fail_start(&self, fail: bool) { self.fail_start.store(fail, Ordering::SeqCst) }
        pub fn fail_stop(&self, fail: bool) { self.fail_stop.store(fail, Ordering::SeqCst) }
        pub fn set_start_delay(&self, delay: Duration) { *self.start_delay.lock().unwrap() = delay }
        pub fn set_stop_delay(&self, delay: Duration) { *self.stop_delay.lock().unwrap() = delay }
        pub fn set_log_lines(&self, lines: Vec<String>) { *self.log_lines.lock().unwrap() = lines }
        pub fn set_stats(&self, stats: Option<ContainerMetrics>) { *self.stats.lock().unwrap() = stats }

        fn record(&self, call: &'static str) { self.calls.lock().unwrap().push(call) }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn stop(&self) -> Result<()> {
            self.record("stop");
            let delay = *self.stop_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_stop.load(Ordering::SeqCst) {
                return Err(ControlError::command("mock stop", "exit status 1"));
            }
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.record("start");
            let delay = *self.start_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ControlError::command("mock start", "exit status 1"));
            }
            Ok(())
        }

        async fn follow_logs(&self) -> Result<LogStream> {
            self.record("logs");
            let lines: Vec<std::io::Result<String>> =
                self.log_lines.lock().unwrap().iter().cloned().map(Ok).collect();
            // behaves like `logs -f`: history first, then waits for more
            let follow = tokio_stream::StreamExt::chain(tokio_stream::iter(lines), tokio_stream::pending());
            Ok(Box::pin(follow))
        }

        async fn stats(&self) -> Option<ContainerMetrics> {
            self.record("stats");
            self.stats.lock().unwrap().clone()
        }
    }

    /// Reports healthy once it has been asked `healthy_after` times.
    pub struct MockHealth {
        healthy_after: AtomicUsize,
        checks: AtomicUsize,
    }

    impl MockHealth {
        pub fn healthy_after(checks: usize) -> Self {
            Self { healthy_after: AtomicUsize::new(checks), checks: AtomicUsize::new(0) }
        }
        pub fn never() -> Self { Self::healthy_after(usize::MAX) }
        pub fn checks(&self) -> usize { self.checks.load(Ordering::SeqCst) }
        pub fn reset(&self, healthy_after: usize) {
            self.checks.store(0, Ordering::SeqCst);
            self.healthy_after.store(healthy_after, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl HealthProbe for MockHealth {
        async fn is_healthy(&self) -> bool {
            let n = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
            n >= self.healthy_after.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub struct MockGpu { gpus: Mutex<Vec<GpuMetrics>> }

    impl MockGpu {
        pub fn new(gpus: Vec<GpuMetrics>) -> Self { Self { gpus: Mutex::new(gpus) } }
        pub fn set(&self, gpus: Vec<GpuMetrics>) { *self.gpus.lock().unwrap() = gpus }
    }

    #[async_trait]
    impl GpuSource for MockGpu {
        async fn query(&self) -> Vec<GpuMetrics> { self.gpus.lock().unwrap().clone() }
    }
}
