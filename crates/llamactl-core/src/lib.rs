//! Control plane core: telemetry store, log collector and lifecycle orchestrator.

pub mod envfile;
pub mod logs;
pub mod orchestrator;
pub mod store;

use std::sync::Arc;

use llamactl_backend::{ContainerRuntime, HealthProbe};
use llamactl_common::{ControlConfig, ProfileSet};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use orchestrator::{Orchestrator, OrchestratorSettings, SwitchHandle, SwitchOutcome};
pub use store::{LifecycleView, TelemetrySnapshot, TelemetryStore};

/// What the user asked for when leaving; both stop the serving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitIntent {
    Quit,
    #[serde(rename = "menu")]
    ReturnToMenu,
}

impl ExitIntent {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitIntent::Quit => 0,
            ExitIntent::ReturnToMenu => 2,
        }
    }
}

/// Everything a task or request handler needs, built once by the process
/// entry point and cloned into each consumer.
#[derive(Clone)]
pub struct ControlPlane {
    pub config: Arc<ControlConfig>,
    pub profiles: Arc<ProfileSet>,
    pub store: Arc<TelemetryStore>,
    pub orchestrator: Orchestrator,
    pub runtime: Arc<dyn ContainerRuntime>,
    shutdown: CancellationToken,
    exit: Arc<watch::Sender<Option<ExitIntent>>>,
}

impl ControlPlane {
    pub fn new(
        config: ControlConfig,
        profiles: ProfileSet,
        runtime: Arc<dyn ContainerRuntime>,
        health: Arc<dyn HealthProbe>,
    ) -> Self {
        let profiles = Arc::new(profiles);
        let store = Arc::new(TelemetryStore::new(config.log_capacity));
        let shutdown = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            profiles.clone(),
            store.clone(),
            runtime.clone(),
            health,
            OrchestratorSettings::from_config(&config),
            shutdown.clone(),
        );
        let (exit, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            profiles,
            store,
            orchestrator,
            runtime,
            shutdown,
            exit: Arc::new(exit),
        }
    }

    /// Cancelled once shutdown begins; background loops exit on it.
    pub fn shutdown_token(&self) -> CancellationToken { self.shutdown.clone() }

    pub fn request_exit(&self, intent: ExitIntent) {
        self.exit.send_replace(Some(intent));
    }

    /// Resolves once [`ControlPlane::request_exit`] has been called.
    pub async fn exit_requested(&self) -> ExitIntent {
        let mut rx = self.exit.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let Some(intent) = current {
                return intent;
            }
            if rx.changed().await.is_err() {
                return ExitIntent::Quit;
            }
        }
    }

    pub async fn shutdown(&self, intent: ExitIntent) -> i32 {
        self.orchestrator.shutdown(intent).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_menu_contract() {
        assert_eq!(ExitIntent::Quit.exit_code(), 0);
        assert_eq!(ExitIntent::ReturnToMenu.exit_code(), 2);
    }

    #[test]
    fn intent_names_on_the_wire() {
        let menu: ExitIntent = serde_json::from_str("\"menu\"").unwrap();
        assert_eq!(menu, ExitIntent::ReturnToMenu);
        assert_eq!(serde_json::to_string(&ExitIntent::Quit).unwrap(), "\"quit\"");
    }
}
