//! Composition root: wires the store, translator, connection manager,
//! router and workflow engine together from one [`BridgeConfig`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::connection::{ConnectionManager, ConnectionSettings, ConnectionStatus};
use crate::dispatch::{Dispatched, Dispatcher};
use crate::error::{BridgeError, Result};
use crate::router::MessageRouter;
use crate::store::{FleetSummary, RobotStateStore};
use crate::transport::Transport;
use crate::translator::Translator;
use crate::workflow::{WorkflowEngine, WorkflowSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub connection: ConnectionStatus,
    pub reconnect_count: u32,
    pub fleet: FleetSummary,
    pub pending_workflows: usize,
}

pub struct Bridge {
    config: BridgeConfig,
    store: Arc<RobotStateStore>,
    translator: Arc<Translator>,
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<MessageRouter>,
    workflow: Arc<WorkflowEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Bridge {
    /// Build every component. Must be called from within a tokio runtime.
    pub fn new(config: BridgeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;
        Self::with_runtime(config, transport, runtime)
    }

    pub fn with_runtime(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;

        let topics = config.topic_scheme();
        let subscriptions = topics.subscriptions().into_iter().map(|(_, t)| t).collect();

        let store = Arc::new(RobotStateStore::new(
            config.app.target_robot_serials.iter().cloned(),
        ));
        let translator = Arc::new(Translator::new(
            &config.topics.manufacturer,
            &config.topics.interface_version,
        ));
        let connection = Arc::new(ConnectionManager::new(
            transport,
            ConnectionSettings::from(&config),
            subscriptions,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&translator),
            Arc::clone(&connection),
            topics.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            topics,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        ));
        let workflow = Arc::new(WorkflowEngine::new(
            &dispatcher,
            WorkflowSettings::from(&config.app),
            runtime,
        ));
        store.add_listener(workflow.clone());

        Ok(Self {
            config,
            store,
            translator,
            connection,
            dispatcher,
            router,
            workflow,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Connect (fatal on failure), start routing inbound messages and the
    /// periodic status log.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }

        info!(
            robots = ?self.store.target_serials(),
            broker = %self.config.broker.url,
            transport = self.connection.transport_name(),
            "🚀 starting robot bridge"
        );

        self.connection.connect().await?;
        self.connection.start(self.router.clone())?;

        let status_loop = tokio::spawn(run_status_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.connection),
            Arc::clone(&self.workflow),
            self.config.app.status_interval(),
        ));
        self.tasks.lock().push(status_loop);

        info!("📡 bridge running");
        Ok(())
    }

    /// Stop within the configured graceful shutdown window.
    pub async fn stop(&self) {
        let budget = self.config.app.graceful_shutdown();
        info!(timeout_secs = budget.as_secs(), "🛑 stopping robot bridge");

        let shutdown = async {
            self.workflow.abandon_all();
            self.connection.stop().await;
            let handles: Vec<JoinHandle<()>> = core::mem::take(&mut *self.tasks.lock());
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "status loop ended abnormally");
                }
            }
        };

        if timeout(budget, shutdown).await.is_err() {
            warn!(timeout_secs = budget.as_secs(), "graceful shutdown timed out");
        } else {
            info!("bridge stopped");
        }
    }

    /// Send a controller-style command to one robot.
    pub async fn send_command(&self, serial: &str, command: &str) -> Result<Dispatched> {
        self.dispatcher.send_command(serial, command).await
    }

    pub fn status_report(&self) -> StatusReport {
        status_report(&self.store, &self.connection, &self.workflow)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RobotStateStore> {
        &self.store
    }

    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn workflow(&self) -> &Arc<WorkflowEngine> {
        &self.workflow
    }
}

fn status_report(
    store: &RobotStateStore,
    connection: &ConnectionManager,
    workflow: &WorkflowEngine,
) -> StatusReport {
    StatusReport {
        connection: connection.status(),
        reconnect_count: connection.reconnect_count(),
        fleet: store.fleet_summary(),
        pending_workflows: workflow.pending_count(),
    }
}

async fn run_status_loop(
    store: Arc<RobotStateStore>,
    connection: Arc<ConnectionManager>,
    workflow: Arc<WorkflowEngine>,
    period: std::time::Duration,
) {
    let mut shutdown = connection.shutdown_signal();
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let report = status_report(&store, &connection, &workflow);
                info!(
                    connection = %report.connection,
                    reconnects = report.reconnect_count,
                    target = report.fleet.target,
                    registered = report.fleet.registered,
                    online = report.fleet.online,
                    executing = report.fleet.executing,
                    with_issues = report.fleet.with_issues,
                    missing = ?store.missing_target_robots(),
                    "📊 fleet status"
                );
            }
        }
    }
    debug!("status loop stopped");
}
