//! Lifecycle orchestrator: owns the idle/starting/running/stopping state
//! machine and serializes model switches behind a non-blocking lock.
//!
//! A switch runs on its own task. The lock guard travels with that task,
//! so the lock covers the whole stop, reconfigure, start, health-wait
//! sequence and is released only once the outcome has been published.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llamactl_backend::{ContainerRuntime, HealthProbe};
use llamactl_common::{
    ActiveModel, ControlConfig, ControlError, LifecycleState, ModelProfile, ProfileSet, Result,
};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::envfile::write_env_file;
use crate::logs::LogCollector;
use crate::store::TelemetryStore;
use crate::ExitIntent;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model_dir: PathBuf,
    pub env_file: PathBuf,
    pub command_timeout: Duration,
    pub health_poll_interval: Duration,
    pub health_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &ControlConfig) -> Self {
        Self {
            model_dir: cfg.model_dir.clone(),
            env_file: cfg.env_file_path(),
            command_timeout: cfg.command_timeout(),
            health_poll_interval: cfg.health_poll_interval(),
            health_timeout: cfg.health_timeout(),
        }
    }
}

/// Terminal result of one switch; `state` is always idle or running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub profile_id: String,
    pub display_name: String,
    pub state: LifecycleState,
    pub status: String,
}

impl SwitchOutcome {
    pub fn succeeded(&self) -> bool { self.state == LifecycleState::Running }
}

/// Returned once a switch has been initiated. Drop it to fire and forget.
pub struct SwitchHandle {
    pub profile_id: String,
    pub display_name: String,
    done: oneshot::Receiver<SwitchOutcome>,
}

impl SwitchHandle {
    /// `None` if the switch has not finished within `budget`.
    pub async fn wait(self, budget: Duration) -> Option<SwitchOutcome> {
        tokio::time::timeout(budget, self.done).await.ok()?.ok()
    }
}

#[derive(Debug, Clone, Copy)]
enum Procedure {
    /// Full stop, reconfigure, start, health-wait.
    Switch,
    /// Attach to an instance started outside llamactl and wait for health.
    Adopt,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    profiles: Arc<ProfileSet>,
    store: Arc<TelemetryStore>,
    runtime: Arc<dyn ContainerRuntime>,
    health: Arc<dyn HealthProbe>,
    settings: OrchestratorSettings,
    switch_lock: Arc<Mutex<()>>,
    switching: Arc<AtomicBool>,
    collector: Mutex<Option<LogCollector>>,
    shutdown: CancellationToken,
}

/// Holds the switch lock and keeps the `switching` flag set while alive.
struct SwitchGuard {
    _lock: OwnedMutexGuard<()>,
    switching: Arc<AtomicBool>,
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        // cleared before the lock field drops, so the next holder's store wins
        self.switching.store(false, Ordering::Release);
    }
}

fn active_model(profile: &ModelProfile) -> ActiveModel {
    ActiveModel { profile_id: profile.id.clone(), display_name: profile.display_name().to_string() }
}

impl Orchestrator {
    pub fn new(
        profiles: Arc<ProfileSet>,
        store: Arc<TelemetryStore>,
        runtime: Arc<dyn ContainerRuntime>,
        health: Arc<dyn HealthProbe>,
        settings: OrchestratorSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                profiles,
                store,
                runtime,
                health,
                settings,
                switch_lock: Arc::new(Mutex::new(())),
                switching: Arc::new(AtomicBool::new(false)),
                collector: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Reads a flag mirrored from the switch lock; never touches the lock.
    pub fn is_switching(&self) -> bool { self.inner.switching.load(Ordering::Acquire) }

    /// Starts a switch to `profile_id` and returns without waiting for it.
    ///
    /// Fails synchronously for an unknown profile, while another switch holds
    /// the lock, or when the profile's model file is missing. In the last case
    /// the state is set to idle and no lifecycle command is issued.
    pub fn switch_model(&self, profile_id: &str) -> Result<SwitchHandle> {
        let (profile, guard) = self.acquire(profile_id)?;
        let artifact = profile.artifact_path(&self.inner.settings.model_dir);
        if !artifact.is_file() {
            let err = ControlError::ArtifactMissing(artifact.display().to_string());
            warn!(target: "orchestrator", profile = %profile.id, "{}", err);
            self.inner.store.set_lifecycle(LifecycleState::Idle, err.to_string());
            drop(guard);
            return Err(err);
        }
        info!(target: "orchestrator", profile = %profile.id, "switch initiated");
        Ok(self.launch(profile, guard, Procedure::Switch))
    }

    /// Marks `profile_id` as active for an instance that is already starting
    /// or running, attaches the log collector and waits for health.
    pub fn adopt(&self, profile_id: &str) -> Result<SwitchHandle> {
        let (profile, guard) = self.acquire(profile_id)?;
        info!(target: "orchestrator", profile = %profile.id, "adopting running instance");
        Ok(self.launch(profile, guard, Procedure::Adopt))
    }

    fn acquire(&self, profile_id: &str) -> Result<(ModelProfile, SwitchGuard)> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ControlError::ShuttingDown);
        }
        let profile = self
            .inner
            .profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| ControlError::ProfileNotFound(profile_id.to_string()))?;
        let guard = self
            .inner
            .switch_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| ControlError::AlreadySwitching)?;
        self.inner.switching.store(true, Ordering::Release);
        Ok((profile, SwitchGuard { _lock: guard, switching: self.inner.switching.clone() }))
    }

    fn launch(&self, profile: ModelProfile, guard: SwitchGuard, procedure: Procedure) -> SwitchHandle {
        let (tx, rx) = oneshot::channel();
        let handle = SwitchHandle {
            profile_id: profile.id.clone(),
            display_name: profile.display_name().to_string(),
            done: rx,
        };
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.run(profile, procedure).await;
            drop(guard);
            let _ = tx.send(outcome);
        });
        handle
    }

    async fn run(&self, profile: ModelProfile, procedure: Procedure) -> SwitchOutcome {
        let name = profile.display_name().to_string();
        // the steps run on their own task so a panic still settles the state
        let steps = {
            let this = self.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                match procedure {
                    Procedure::Switch => this.switch_steps(&profile).await,
                    Procedure::Adopt => this.adopt_steps(&profile).await,
                }
            })
        };
        let result = match steps.await {
            Ok(result) => result,
            Err(e) => Err(ControlError::Internal(e.to_string())),
        };
        let (state, status) = match &result {
            Ok(()) => (LifecycleState::Running, String::new()),
            Err(e) if e.is_timeout() => (LifecycleState::Idle, format!("Timeout during switch to {name}: {e}")),
            Err(e) => (LifecycleState::Idle, format!("Switch to {name} failed: {e}")),
        };
        self.inner.store.set_lifecycle(state, status.clone());
        match &result {
            Ok(()) => info!(target: "orchestrator", profile = %profile.id, "{} is running", name),
            Err(e) => warn!(target: "orchestrator", profile = %profile.id, "switch ended idle: {}", e),
        }
        SwitchOutcome { profile_id: profile.id, display_name: name, state, status }
    }

    async fn switch_steps(&self, profile: &ModelProfile) -> Result<()> {
        let inner = &self.inner;
        let name = profile.display_name();
        let current = inner.store.lifecycle();

        if matches!(current.state, LifecycleState::Running | LifecycleState::Starting) {
            let previous = current
                .active_model
                .as_ref()
                .map(|m| m.display_name.clone())
                .unwrap_or_else(|| String::from("current model"));
            inner.store.set_lifecycle(LifecycleState::Stopping, format!("Stopping {previous}"));
            inner.store.update_logs(format!("--- llamactl: stopping {previous}, switching to {name} ---"));
            info!(target: "orchestrator", "stopping {}", previous);
            self.stop_log_collector().await;
            self.bounded("stop command", inner.runtime.stop()).await?;
        }

        write_env_file(&inner.settings.env_file, profile).await?;

        inner.store.set_lifecycle_for(active_model(profile), LifecycleState::Starting, format!("Starting {name}"));
        info!(target: "orchestrator", "starting {}", name);
        self.bounded("start command", inner.runtime.start()).await?;
        self.restart_log_collector().await;

        self.wait_healthy().await
    }

    async fn adopt_steps(&self, profile: &ModelProfile) -> Result<()> {
        let name = profile.display_name();
        self.inner
            .store
            .set_lifecycle_for(active_model(profile), LifecycleState::Starting, format!("Waiting for {name}"));
        self.restart_log_collector().await;
        self.wait_healthy().await
    }

    async fn bounded(&self, what: &str, op: impl Future<Output = Result<()>>) -> Result<()> {
        let limit = self.inner.settings.command_timeout;
        tokio::time::timeout(limit, op)
            .await
            .map_err(|_| ControlError::Timeout { what: what.to_string(), limit })?
    }

    async fn wait_healthy(&self) -> Result<()> {
        let settings = &self.inner.settings;
        let deadline = Instant::now() + settings.health_timeout;
        loop {
            let healthy = tokio::time::timeout_at(deadline, self.inner.health.is_healthy())
                .await
                .unwrap_or(false);
            if healthy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ControlError::HealthTimeout(settings.health_timeout));
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(ControlError::ShuttingDown),
                _ = tokio::time::sleep(settings.health_poll_interval) => {}
            }
        }
    }

    async fn stop_log_collector(&self) {
        let previous = self.inner.collector.lock().await.take();
        if let Some(collector) = previous {
            collector.stop().await;
        }
    }

    /// At most one collector is alive: the old one is stopped before the
    /// new stream is opened.
    async fn restart_log_collector(&self) {
        let mut slot = self.inner.collector.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        match self.inner.runtime.follow_logs().await {
            Ok(lines) => {
                *slot = Some(LogCollector::spawn(lines, self.inner.store.clone(), self.inner.shutdown.clone()));
            }
            Err(e) => {
                warn!(target: "logs", "cannot follow logs: {}", e);
                self.inner.store.update_logs(format!("(log collection error: {e})"));
            }
        }
    }

    /// Stops background work and the serving process, then maps the intent
    /// to the process exit code.
    pub async fn shutdown(&self, intent: ExitIntent) -> i32 {
        info!(target: "orchestrator", ?intent, "shutting down");
        self.inner.shutdown.cancel();

        // an in-flight switch sees the flag at its next health poll, but a
        // lifecycle command runs to its own timeout
        let settle = self.inner.settings.command_timeout * 2 + Duration::from_secs(1);
        let _guard = match tokio::time::timeout(settle, self.inner.switch_lock.clone().lock_owned()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(target: "orchestrator", "switch still running at shutdown");
                None
            }
        };

        self.stop_log_collector().await;
        self.inner.store.set_lifecycle(LifecycleState::Stopping, "Stopping server");
        let status = match self.bounded("stop command", self.inner.runtime.stop()).await {
            Ok(()) => String::from("Stopped"),
            Err(e) => {
                warn!(target: "orchestrator", "stop at shutdown failed: {}", e);
                format!("Stop failed: {e}")
            }
        };
        self.inner.store.set_lifecycle(LifecycleState::Idle, status);
        intent.exit_code()
    }
}
