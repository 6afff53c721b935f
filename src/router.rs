//! Inbound message routing.
//!
//! Each message is classified by topic, its topic and payload are parsed,
//! the serial in the topic is cross-checked against the payload, roster
//! membership is enforced and the result is handed to the store or, for
//! controller commands, to the [`Dispatcher`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::connection::MessageHandler;
use crate::dispatch::{Dispatched, Dispatcher};
use crate::protocol::{self, ProtocolError, RobotUpdate};
use crate::store::{MergeOutcome, RobotStateStore};
use crate::topic::{TopicKind, TopicScheme};
use crate::translator::RobotCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownTopic,
    Malformed(ProtocolError),
    NotTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Merged(MergeOutcome),
    Factsheet { serial: String, recorded: bool },
    Sent(Vec<Dispatched>),
    Rejected(String),
    Dropped(DropReason),
}

pub struct MessageRouter {
    topics: TopicScheme,
    store: Arc<RobotStateStore>,
    dispatcher: Arc<Dispatcher>,
}

impl MessageRouter {
    pub fn new(topics: TopicScheme, store: Arc<RobotStateStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            topics,
            store,
            dispatcher,
        }
    }

    pub async fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        match self.topics.classify(topic) {
            Some(TopicKind::ControllerCommand) => self.route_command(payload).await,
            Some(_) => self.route_robot(topic, payload),
            None => {
                debug!(topic = %topic, "message on unhandled topic");
                RouteOutcome::Dropped(DropReason::UnknownTopic)
            }
        }
    }

    /// Connection, state and factsheet messages.
    pub fn route_robot(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let parsed = match self.topics.parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => return drop_malformed(topic, e),
        };

        if parsed.kind == TopicKind::Factsheet {
            let factsheet = match protocol::decode_factsheet(payload) {
                Ok(f) => f,
                Err(e) => return drop_malformed(topic, e),
            };
            if let Err(e) = check_serial(&parsed.serial, &factsheet.serial_number) {
                return drop_malformed(topic, e);
            }
            if !self.store.is_target(&parsed.serial) {
                debug!(serial = %parsed.serial, "factsheet from robot outside the roster");
                return RouteOutcome::Dropped(DropReason::NotTarget);
            }
            info!(
                serial = %parsed.serial,
                manufacturer = %parsed.manufacturer,
                actions = factsheet.protocol_features.agv_actions.len(),
                "factsheet response"
            );
            let recorded = self.store.mark_factsheet_received(&parsed.serial);
            return RouteOutcome::Factsheet {
                serial: parsed.serial,
                recorded,
            };
        }

        let decoded = match parsed.kind {
            TopicKind::Connection => protocol::decode_connection_topic(payload),
            _ => protocol::decode_state(payload).map(|s| RobotUpdate::State(Box::new(s))),
        };
        let update = match decoded {
            Ok(update) => update,
            Err(e) => return drop_malformed(topic, e),
        };

        if let Err(e) = check_serial(&parsed.serial, update.serial()) {
            return drop_malformed(topic, e);
        }
        if !self.store.is_target(&parsed.serial) {
            debug!(serial = %parsed.serial, "update from robot outside the roster");
            return RouteOutcome::Dropped(DropReason::NotTarget);
        }

        RouteOutcome::Merged(self.store.merge(&update))
    }

    /// `"<serial>:<command>"` from the controller topic.
    pub async fn route_command(&self, payload: &[u8]) -> RouteOutcome {
        let parsed = match protocol::parse_controller_command(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "rejected controller command");
                return RouteOutcome::Rejected(e.to_string());
            }
        };

        let Some(serial) = parsed.serial else {
            return self.broadcast(&parsed.command).await;
        };

        info!(serial = %serial, command = %parsed.command, "📥 controller command");
        match self.dispatcher.send_command(&serial, &parsed.command).await {
            Ok(sent) => RouteOutcome::Sent(vec![sent]),
            Err(e) => {
                warn!(serial = %serial, command = %parsed.command, error = %e, "command not sent");
                RouteOutcome::Rejected(e.to_string())
            }
        }
    }

    async fn broadcast(&self, command: &str) -> RouteOutcome {
        let command = match RobotCommand::parse(command) {
            Ok(c) => c,
            Err(e) => return RouteOutcome::Rejected(e.to_string()),
        };

        info!(command = %command, "📥 broadcast controller command");
        let results = self.dispatcher.broadcast(&command).await;
        if results.is_empty() {
            warn!(command = %command, "no online robots to broadcast to");
        }

        let mut sent = Vec::new();
        for (serial, result) in results {
            match result {
                Ok(d) => sent.push(d),
                Err(e) => warn!(serial = %serial, error = %e, "broadcast command not sent"),
            }
        }
        RouteOutcome::Sent(sent)
    }
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn handle_message(&self, topic: String, payload: Vec<u8>) {
        self.route(&topic, &payload).await;
    }
}

fn check_serial(topic_serial: &str, payload_serial: &str) -> Result<(), ProtocolError> {
    if topic_serial == payload_serial {
        Ok(())
    } else {
        Err(ProtocolError::SerialMismatch {
            topic: topic_serial.to_string(),
            payload: payload_serial.to_string(),
        })
    }
}

fn drop_malformed(topic: &str, error: ProtocolError) -> RouteOutcome {
    warn!(topic = %topic, error = %error, "dropping message");
    RouteOutcome::Dropped(DropReason::Malformed(error))
}
