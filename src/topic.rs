//! Topic grammar for the robot-facing and controller-facing channels.
//!
//! Robot topics follow `{prefix}/{manufacturer}/{serial}/{channel}`. The
//! controller publishes plain-text commands on a single fixed topic.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

pub const DEFAULT_PREFIX: &str = "meili/v2";
pub const DEFAULT_MANUFACTURER: &str = "Roboligent";
pub const DEFAULT_CONTROLLER_TOPIC: &str = "bridge/actions";

const CONNECTION_CHANNEL: &str = "connection";
const STATE_CHANNEL: &str = "state";
const FACTSHEET_CHANNEL: &str = "factsheet";
const INSTANT_ACTIONS_CHANNEL: &str = "instantActions";
const ORDERS_CHANNEL: &str = "orders";

/// Category of an inbound message, decided purely from its topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKind {
    ControllerCommand,
    Connection,
    State,
    Factsheet,
}

/// Outbound robot channel a translated message is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundChannel {
    InstantActions,
    Orders,
}

impl OutboundChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundChannel::InstantActions => INSTANT_ACTIONS_CHANNEL,
            OutboundChannel::Orders => ORDERS_CHANNEL,
        }
    }
}

/// Identity extracted from a robot topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotTopic {
    pub kind: TopicKind,
    pub manufacturer: String,
    pub serial: String,
}

/// Topic layout shared by the router, the connection manager and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    pub prefix: String,
    pub manufacturer: String,
    pub controller_topic: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            manufacturer: DEFAULT_MANUFACTURER.to_string(),
            controller_topic: DEFAULT_CONTROLLER_TOPIC.to_string(),
        }
    }
}

impl TopicScheme {
    pub fn new(prefix: &str, manufacturer: &str, controller_topic: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            manufacturer: manufacturer.to_string(),
            controller_topic: controller_topic.to_string(),
        }
    }

    /// The fixed set of patterns re-subscribed on every (re)connection.
    pub fn subscriptions(&self) -> Vec<(TopicKind, String)> {
        vec![
            (TopicKind::ControllerCommand, self.controller_topic.clone()),
            (
                TopicKind::Connection,
                format!("{}/{}/+/{}", self.prefix, self.manufacturer, CONNECTION_CHANNEL),
            ),
            (
                TopicKind::State,
                format!("{}/{}/+/{}", self.prefix, self.manufacturer, STATE_CHANNEL),
            ),
            (
                TopicKind::Factsheet,
                format!("{}/+/+/{}", self.prefix, FACTSHEET_CHANNEL),
            ),
        ]
    }

    /// Decide which category a topic belongs to by its shape alone.
    ///
    /// Returns `None` for topics the bridge never subscribes to.
    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.controller_topic {
            return Some(TopicKind::ControllerCommand);
        }

        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        match rest.rsplit('/').next()? {
            CONNECTION_CHANNEL => Some(TopicKind::Connection),
            STATE_CHANNEL => Some(TopicKind::State),
            FACTSHEET_CHANNEL => Some(TopicKind::Factsheet),
            _ => None,
        }
    }

    /// Parse a robot topic, checking every fixed segment.
    ///
    /// Connection and state topics must name the configured manufacturer;
    /// factsheet topics accept any manufacturer segment and report it back.
    pub fn parse(&self, topic: &str) -> Result<RobotTopic, ProtocolError> {
        let malformed = || ProtocolError::MalformedTopic(topic.to_string());

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(malformed)?;

        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(malformed());
        }

        let (manufacturer, serial, channel) = (parts[0], parts[1], parts[2]);
        let kind = match channel {
            CONNECTION_CHANNEL => TopicKind::Connection,
            STATE_CHANNEL => TopicKind::State,
            FACTSHEET_CHANNEL => TopicKind::Factsheet,
            _ => return Err(malformed()),
        };

        if kind != TopicKind::Factsheet && manufacturer != self.manufacturer {
            return Err(malformed());
        }

        Ok(RobotTopic {
            kind,
            manufacturer: manufacturer.to_string(),
            serial: serial.to_string(),
        })
    }

    pub fn outbound(&self, serial: &str, channel: OutboundChannel) -> String {
        format!(
            "{}/{}/{}/{}",
            self.prefix,
            self.manufacturer,
            serial,
            channel.as_str()
        )
    }

    pub fn instant_actions(&self, serial: &str) -> String {
        self.outbound(serial, OutboundChannel::InstantActions)
    }

    pub fn orders(&self, serial: &str) -> String {
        self.outbound(serial, OutboundChannel::Orders)
    }

    pub fn connection(&self, serial: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, self.manufacturer, serial, CONNECTION_CHANNEL)
    }

    pub fn state(&self, serial: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, self.manufacturer, serial, STATE_CHANNEL)
    }

    pub fn factsheet(&self, manufacturer: &str, serial: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, manufacturer, serial, FACTSHEET_CHANNEL)
    }
}
