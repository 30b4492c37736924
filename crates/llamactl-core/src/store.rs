//! The telemetry store: one mutex over every observable fact.
//!
//! Writers replace whole sub-structures under a single lock acquisition and
//! readers take copies, so nobody holds the lock while rendering, serializing
//! or doing I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use llamactl_common::{ActiveModel, ContainerMetrics, GpuMetrics, HostMetrics, LifecycleState};
use serde::Serialize;

/// A full copy of the store, log buffer included.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub log_lines: Vec<String>,
    pub gpus: Vec<GpuMetrics>,
    pub host: HostMetrics,
    pub container: ContainerMetrics,
    pub state: LifecycleState,
    pub status: String,
    pub active_model: Option<ActiveModel>,
}

/// Lifecycle fields only; cheap enough for every status request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleView {
    pub state: LifecycleState,
    pub status: String,
    pub active_model: Option<ActiveModel>,
}

#[derive(Debug, Default)]
struct TelemetryState {
    log_lines: VecDeque<String>,
    log_capacity: usize,
    gpus: Vec<GpuMetrics>,
    host: HostMetrics,
    container: ContainerMetrics,
    state: LifecycleState,
    status: String,
    active_model: Option<ActiveModel>,
}

#[derive(Debug)]
pub struct TelemetryStore {
    inner: Mutex<TelemetryState>,
}

impl TelemetryStore {
    pub fn new(log_capacity: usize) -> Self {
        let log_capacity = log_capacity.max(1);
        Self {
            inner: Mutex::new(TelemetryState {
                log_lines: VecDeque::with_capacity(log_capacity),
                log_capacity,
                ..Default::default()
            }),
        }
    }

    // Every update replaces whole values, so a panic elsewhere cannot leave a
    // half-written record behind; recover the guard instead of propagating.
    fn lock(&self) -> MutexGuard<'_, TelemetryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> TelemetrySnapshot {
        let g = self.lock();
        TelemetrySnapshot {
            log_lines: g.log_lines.iter().cloned().collect(),
            gpus: g.gpus.clone(),
            host: g.host.clone(),
            container: g.container.clone(),
            state: g.state,
            status: g.status.clone(),
            active_model: g.active_model.clone(),
        }
    }

    pub fn lifecycle(&self) -> LifecycleView {
        let g = self.lock();
        LifecycleView { state: g.state, status: g.status.clone(), active_model: g.active_model.clone() }
    }

    pub fn state(&self) -> LifecycleState { self.lock().state }

    /// The most recent `n` log lines, oldest first.
    pub fn log_tail(&self, n: usize) -> Vec<String> {
        let g = self.lock();
        let skip = g.log_lines.len().saturating_sub(n);
        g.log_lines.iter().skip(skip).cloned().collect()
    }

    pub fn update_logs(&self, line: impl Into<String>) {
        let mut g = self.lock();
        if g.log_lines.len() == g.log_capacity {
            g.log_lines.pop_front();
        }
        g.log_lines.push_back(line.into());
    }

    pub fn replace_gpu_metrics(&self, gpus: Vec<GpuMetrics>) { self.lock().gpus = gpus; }
    pub fn replace_host_metrics(&self, host: HostMetrics) { self.lock().host = host; }
    pub fn replace_container_metrics(&self, container: ContainerMetrics) { self.lock().container = container; }

    pub fn set_lifecycle(&self, state: LifecycleState, message: impl Into<String>) {
        let mut g = self.lock();
        g.state = state;
        g.status = message.into();
    }

    pub fn set_active_model(&self, model: Option<ActiveModel>) { self.lock().active_model = model; }

    /// Publishes the new active model together with its lifecycle state so
    /// no reader sees one without the other.
    pub fn set_lifecycle_for(&self, model: ActiveModel, state: LifecycleState, message: impl Into<String>) {
        let mut g = self.lock();
        g.active_model = Some(model);
        g.state = state;
        g.status = message.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_keeps_most_recent_lines() {
        let store = TelemetryStore::new(5);
        for i in 0..8 {
            store.update_logs(format!("line {i}"));
        }
        let snap = store.get();
        assert_eq!(snap.log_lines, ["line 3", "line 4", "line 5", "line 6", "line 7"]);
    }

    #[test]
    fn log_tail_is_oldest_first() {
        let store = TelemetryStore::new(10);
        for i in 0..4 {
            store.update_logs(format!("{i}"));
        }
        assert_eq!(store.log_tail(2), ["2", "3"]);
        assert_eq!(store.log_tail(100).len(), 4);
    }

    #[test]
    fn gpu_list_is_replaced_wholesale() {
        let store = TelemetryStore::new(1);
        let gpu = |index| GpuMetrics { index, ..Default::default() };
        store.replace_gpu_metrics(vec![gpu(0), gpu(1)]);
        store.replace_gpu_metrics(vec![gpu(1)]);
        let indices: Vec<_> = store.get().gpus.iter().map(|g| g.index).collect();
        assert_eq!(indices, [1]);
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let store = TelemetryStore::new(4);
        store.set_lifecycle(LifecycleState::Starting, "Starting a");
        let snap = store.get();
        store.set_lifecycle(LifecycleState::Running, "");
        assert_eq!(snap.state, LifecycleState::Starting);
        assert_eq!(snap.status, "Starting a");
        assert_eq!(store.state(), LifecycleState::Running);
    }

    #[test]
    fn lifecycle_and_model_publish_together() {
        let store = TelemetryStore::new(1);
        let model = ActiveModel { profile_id: "a".into(), display_name: "A".into() };
        store.set_lifecycle_for(model.clone(), LifecycleState::Starting, "Starting A");
        let view = store.lifecycle();
        assert_eq!(view.active_model, Some(model));
        assert_eq!(view.state, LifecycleState::Starting);
    }
}
