use crate::config::Config;
use crate::monitor::{BayHandle, BayMonitor};
use crate::registry::StatusRegistry;
use crate::source::{SimulatedConnector, SourceConnector};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::{signal, sync::broadcast, task::JoinHandle};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ValidationError),
    #[error("No bay could be started")]
    NoBaysStarted,
}

/// The occupancy-detection service: one monitor task per bay feeding a
/// shared status registry. Constructed explicitly and passed by
/// reference to whatever composes it (the API layer, tests); nothing
/// here is process-global, so independent instances coexist freely.
pub struct BayService {
    registry: Arc<StatusRegistry>,
    handles: BTreeMap<u32, BayHandle>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl BayService {
    /// Validates the configuration and spawns the monitors. A bay whose
    /// tunables fail validation refuses to start and is logged; the
    /// remaining bays run unaffected.
    pub fn start<C: SourceConnector>(config: &Config, connector: C) -> Result<Self, ServiceError> {
        config.validate()?;

        let registry = Arc::new(StatusRegistry::new(config.bays.iter().map(|b| b.id)));
        let connector = Arc::new(connector);
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut handles = BTreeMap::new();
        let mut tasks = Vec::new();
        for bay in &config.bays {
            match BayMonitor::new(bay, config, connector.clone(), registry.clone()) {
                Ok((monitor, handle)) => {
                    tasks.push(tokio::spawn(monitor.run(shutdown_tx.subscribe())));
                    handles.insert(bay.id, handle);
                }
                Err(error) => {
                    tracing::error!(bay_id = bay.id, %error, "Bay refused to start");
                }
            }
        }
        if tasks.is_empty() {
            return Err(ServiceError::NoBaysStarted);
        }

        tracing::info!(
            bays = tasks.len(),
            configured = config.bays.len(),
            "Bay service started"
        );
        Ok(Self {
            registry,
            handles,
            shutdown_tx,
            tasks,
        })
    }

    /// The read side consumed by the status API.
    pub fn registry(&self) -> &Arc<StatusRegistry> {
        &self.registry
    }

    /// Operator handle for one bay, if it started.
    pub fn handle(&self, bay_id: u32) -> Option<&BayHandle> {
        self.handles.get(&bay_id)
    }

    /// Coordinated shutdown: every monitor stops after its current cycle
    /// and releases its stream connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Bay service stopped");
    }
}

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    // Real deployments plug a transport in through `SourceConnector`;
    // the binary runs the synthetic feed so the whole pipeline is
    // exercisable without cameras.
    let connector = SimulatedConnector {
        occupancy_cycle: Some((600, 200)),
        ..SimulatedConnector::default()
    };
    let service = BayService::start(&config, connector)?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");
    service.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
