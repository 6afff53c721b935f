//! Connection lifecycle for the single broker connection.
//!
//! Owns bounded-retry connect, resubscription after every (re)connect,
//! publish with timeout, the transport event loop and a periodic health
//! check. All background loops exit on the shared shutdown signal.

use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, ReconnectPolicy};
use crate::error::{BridgeError, Result};
use crate::transport::{QoS, Transport, TransportEvent};

/// Consecutive failed health checks before a critical signal is raised.
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ConnectionLost,
    ConnectionFailed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::ConnectionLost => "CONNECTION_LOST",
            ConnectionStatus::ConnectionFailed => "CONNECTION_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub qos: QoS,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_attempts: u32,
    pub publish_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub disconnect_grace: Duration,
    pub health_check_interval: Duration,
    pub reconnect_policy: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for ConnectionSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            qos: config.qos(),
            connect_timeout: config.broker.connect_timeout(),
            reconnect_delay: config.broker.reconnect_delay(),
            max_attempts: config.broker.max_reconnect_attempts,
            publish_timeout: config.broker.publish_timeout(),
            subscribe_timeout: config.broker.subscribe_timeout(),
            disconnect_grace: config.broker.disconnect_grace(),
            health_check_interval: config.app.health_check_interval(),
            reconnect_policy: config.app.steady_state_reconnect,
        }
    }
}

/// Receives every inbound message. Called on its own task per message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, topic: String, payload: Vec<u8>);
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    subscriptions: Vec<String>,
    status: RwLock<ConnectionStatus>,
    reconnect_count: AtomicU32,
    health_failures: AtomicU32,
    reconnecting: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        subscriptions: Vec<String>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            settings,
            subscriptions,
            status: RwLock::new(ConnectionStatus::Disconnected),
            reconnect_count: AtomicU32::new(0),
            health_failures: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Background task handles still held for `stop` to join.
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn consecutive_health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// A receiver that flips to `true` when [`stop`](Self::stop) is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let old = {
            let mut guard = self.status.write();
            core::mem::replace(&mut *guard, status)
        };
        if old != status {
            debug!(old = %old, new = %status, "connection status changed");
        }
    }

    /// Connect with bounded retries, then subscribe to every inbound pattern.
    pub async fn connect(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let max = self.settings.max_attempts.max(1);
        let mut last_error = String::new();

        self.set_status(ConnectionStatus::Connecting);

        for attempt in 1..=max {
            if *shutdown.borrow() {
                return Err(BridgeError::Cancelled);
            }

            info!(
                transport = self.transport.name(),
                attempt,
                max_attempts = max,
                "connecting to broker"
            );

            match self.connect_once().await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        if let Err(e) = self.transport.disconnect(self.settings.disconnect_grace).await {
                            warn!(error = %e, "disconnect after cancelled connect failed");
                        }
                        self.set_status(ConnectionStatus::Disconnected);
                        return Err(BridgeError::Cancelled);
                    }
                    self.set_status(ConnectionStatus::Connected);
                    self.health_failures.store(0, Ordering::SeqCst);
                    info!(attempt, "✅ connected to broker");
                    self.subscribe_all().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts = max, error = %e, "connect attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < max {
                tokio::select! {
                    () = time::sleep(self.settings.reconnect_delay) => {}
                    _ = shutdown.changed() => {
                        info!("connect retry aborted by shutdown");
                        self.set_status(ConnectionStatus::Disconnected);
                        return Err(BridgeError::Cancelled);
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::ConnectionFailed);
        error!(attempts = max, error = %last_error, "❌ giving up connecting to broker");
        Err(BridgeError::ConnectFailed {
            attempts: max,
            last_error,
        })
    }

    async fn connect_once(&self) -> Result<()> {
        match timeout(self.settings.connect_timeout, self.transport.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Transport(e.to_string())),
            Err(_) => Err(BridgeError::ConnectTimeout(self.settings.connect_timeout)),
        }
    }

    /// Subscribe to every pattern. Failures are logged and skipped.
    /// Returns how many subscriptions succeeded.
    pub async fn subscribe_all(&self) -> usize {
        let mut ok = 0;
        for topic in &self.subscriptions {
            let result = timeout(
                self.settings.subscribe_timeout,
                self.transport.subscribe(topic, self.settings.qos),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    info!(topic = %topic, "subscribed");
                    ok += 1;
                }
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "subscription failed"),
                Err(_) => warn!(topic = %topic, "subscription timed out"),
            }
        }
        if ok < self.subscriptions.len() {
            warn!(
                subscribed = ok,
                expected = self.subscriptions.len(),
                "running with degraded subscriptions"
            );
        }
        ok
    }

    /// Publish with the configured QoS. Fails fast when not connected.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        match timeout(
            self.settings.publish_timeout,
            self.transport.publish(topic, payload, self.settings.qos),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(topic = %topic, "published");
                Ok(())
            }
            Ok(Err(e)) => Err(BridgeError::Transport(e.to_string())),
            Err(_) => Err(BridgeError::PublishTimeout {
                topic: topic.to_string(),
                timeout: self.settings.publish_timeout,
            }),
        }
    }

    /// Spawn the event loop and the health check loop.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let events = self.transport.take_events().ok_or(BridgeError::AlreadyStarted)?;

        let event_loop = tokio::spawn(Arc::clone(self).run_event_loop(events, handler));
        let health_loop = tokio::spawn(Arc::clone(self).run_health_loop());

        let mut tasks = self.tasks.lock();
        tasks.push(event_loop);
        tasks.push(health_loop);
        Ok(())
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &handler).await,
                    None => {
                        warn!("transport event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent, handler: &Arc<dyn MessageHandler>) {
        match event {
            TransportEvent::Message { topic, payload } => {
                let handler = Arc::clone(handler);
                tokio::spawn(async move {
                    handler.handle_message(topic, payload).await;
                });
            }
            TransportEvent::Connected => {
                self.set_status(ConnectionStatus::Connected);
                self.health_failures.store(0, Ordering::SeqCst);
                info!("🔗 broker connection re-established");
                self.subscribe_all().await;
            }
            TransportEvent::ConnectionLost(reason) => {
                self.set_status(ConnectionStatus::ConnectionLost);
                let count = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(reason = %reason, reconnect_count = count, "⚠️ broker connection lost");
                if self.settings.reconnect_policy == ReconnectPolicy::Managed {
                    self.spawn_managed_reconnect();
                }
            }
            TransportEvent::Reconnecting => {
                self.set_status(ConnectionStatus::Connecting);
                info!("reconnecting to broker");
            }
        }
    }

    fn spawn_managed_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = this.connect().await {
                warn!(error = %e, "managed reconnect did not succeed");
            }
            this.reconnecting.store(false, Ordering::SeqCst);
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    async fn run_health_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = time::interval(self.settings.health_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        interval.tick().await;

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    self.check_health();
                }
            }
        }
        debug!("health check loop stopped");
    }

    /// One health check. Returns `true` when the connection looks healthy.
    pub fn check_health(self: &Arc<Self>) -> bool {
        let status = self.status();
        if status == ConnectionStatus::Connected && self.transport.is_connected() {
            let previous = self.health_failures.swap(0, Ordering::SeqCst);
            if previous > 0 {
                info!(previous_failures = previous, "connection health recovered");
            }
            return true;
        }

        let failures = self.health_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(status = %status, consecutive_failures = failures, "health check failed");
        if failures == HEALTH_FAILURE_THRESHOLD {
            error!(
                status = %status,
                consecutive_failures = failures,
                "🚨 CRITICAL: broker connection unhealthy"
            );
        }

        if status == ConnectionStatus::ConnectionFailed
            && self.settings.reconnect_policy == ReconnectPolicy::Managed
        {
            self.spawn_managed_reconnect();
        }
        false
    }

    /// Signal shutdown, disconnect within the grace period and wait for every
    /// background loop to exit.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stored even when no loop has subscribed yet.
        self.shutdown_tx.send_replace(true);

        let grace = self.settings.disconnect_grace;
        match timeout(grace + Duration::from_millis(50), self.transport.disconnect(grace)).await {
            Ok(Ok(())) => info!("disconnected from broker"),
            Ok(Err(e)) => warn!(error = %e, "disconnect reported an error"),
            Err(_) => warn!(grace_ms = grace.as_millis() as u64, "disconnect exceeded grace period"),
        }

        let handles: Vec<JoinHandle<()>> = core::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
    }
}
