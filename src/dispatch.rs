//! The single outbound path: roster and liveness gate, translate, publish.

use std::sync::Arc;

use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::error::{BridgeError, Result};
use crate::protocol::RobotActionMessage;
use crate::store::RobotStateStore;
use crate::topic::TopicScheme;
use crate::translator::{RobotCommand, Translator};

/// What was sent, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub serial: String,
    pub topic: String,
    pub header_id: u64,
    pub action_type: String,
    pub order_id: Option<String>,
}

pub struct Dispatcher {
    store: Arc<RobotStateStore>,
    translator: Arc<Translator>,
    connection: Arc<ConnectionManager>,
    topics: TopicScheme,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RobotStateStore>,
        translator: Arc<Translator>,
        connection: Arc<ConnectionManager>,
        topics: TopicScheme,
    ) -> Self {
        Self {
            store,
            translator,
            connection,
            topics,
        }
    }

    pub fn store(&self) -> &Arc<RobotStateStore> {
        &self.store
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Parse a raw command string and send it.
    pub async fn send_command(&self, serial: &str, command: &str) -> Result<Dispatched> {
        self.check_target(serial)?;
        let command = RobotCommand::parse(command)?;
        self.send(serial, &command).await
    }

    /// Send a parsed command to one roster robot that is currently online.
    pub async fn send(&self, serial: &str, command: &RobotCommand) -> Result<Dispatched> {
        self.check_target(serial)?;
        if !self.store.is_online(serial) {
            return Err(BridgeError::RobotOffline(serial.to_string()));
        }

        let manufacturer = self.store.manufacturer_of(serial);
        let message = self.translator.build(command, serial, manufacturer.as_deref());
        let topic = self.topics.outbound(serial, command.channel());
        self.publish(&topic, &message).await
    }

    /// Send to every online roster robot. Per-robot failures are collected.
    pub async fn broadcast(&self, command: &RobotCommand) -> Vec<(String, Result<Dispatched>)> {
        let mut results = Vec::new();
        for serial in self.store.online_robots() {
            let result = self.send(&serial, command).await;
            results.push((serial, result));
        }
        results
    }

    async fn publish(&self, topic: &str, message: &RobotActionMessage) -> Result<Dispatched> {
        let payload = serde_json::to_vec(message)?;
        let dispatched = Dispatched {
            serial: message.serial_number.clone(),
            topic: topic.to_string(),
            header_id: message.header_id,
            action_type: message.primary_action_type().to_string(),
            order_id: message.order_id.clone(),
        };

        match self.connection.publish(topic, payload).await {
            Ok(()) => {
                info!(
                    serial = %dispatched.serial,
                    topic = %dispatched.topic,
                    header_id = dispatched.header_id,
                    action_type = %dispatched.action_type,
                    "📤 sent robot command"
                );
                Ok(dispatched)
            }
            Err(e) => {
                warn!(serial = %dispatched.serial, topic = %topic, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    fn check_target(&self, serial: &str) -> Result<()> {
        if self.store.is_target(serial) {
            Ok(())
        } else {
            Err(BridgeError::NotTarget(serial.to_string()))
        }
    }
}
