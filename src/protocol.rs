//! Wire types and codec for the robot protocol and the controller command line.
//!
//! Inbound payloads are JSON documents keyed in camelCase; factsheet bodies use
//! PascalCase for their nested sections. Outbound messages are built by the
//! [`crate::translator`] module and serialized with `serde_json`.

use core::fmt;

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2.0.0";
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("payload exceeds {MAX_PAYLOAD_SIZE} bytes")]
    MessageTooLarge,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("serial number mismatch: topic={topic}, payload={payload}")]
    SerialMismatch { topic: String, payload: String },
    #[error("invalid controller command: {0}")]
    InvalidCommand(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "CONNECTIONBROKEN")]
    ConnectionBroken,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Online => write!(f, "ONLINE"),
            ConnectionState::ConnectionBroken => write!(f, "CONNECTIONBROKEN"),
            ConnectionState::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Minimal connection-status message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMessage {
    pub header_id: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,
    pub connection_state: ConnectionState,
}

/// Detailed telemetry. Every operational field is optional so partial
/// payloads merge without clobbering what is already known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMessage {
    pub header_id: u64,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub serial_number: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state: Option<ConnectionState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_node_sequence_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driving: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_since_last_node: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_states: Option<Vec<ActionState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_states: Option<Vec<NodeState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_states: Option<Vec<EdgeState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub information: Option<Vec<InfoMessage>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agv_position: Option<AgvPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_state: Option<BatteryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_state: Option<SafetyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Velocity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_base_request: Option<bool>,
}

impl StateMessage {
    /// True when the payload carries anything beyond the connection header.
    pub fn is_detailed(&self) -> bool {
        self.order_id.is_some()
            || self.order_update_id.is_some()
            || self.last_node_id.is_some()
            || self.driving.is_some()
            || self.paused.is_some()
            || self.operating_mode.is_some()
            || self.action_states.is_some()
            || self.node_states.is_some()
            || self.edge_states.is_some()
            || self.errors.is_some()
            || self.agv_position.is_some()
            || self.battery_state.is_some()
            || self.safety_state.is_some()
            || self.velocity.is_some()
            || self.last_node_sequence_id.is_some()
            || self.distance_since_last_node.is_some()
            || self.information.is_some()
            || self.new_base_request.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionState {
    pub action_id: String,
    pub action_type: String,
    pub action_description: String,
    pub action_status: String,
    pub result_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeState {
    pub node_id: String,
    pub sequence_id: u64,
    pub released: bool,
    pub node_position: Option<NodePosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EdgeState {
    pub edge_id: String,
    pub sequence_id: u64,
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgvPosition {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub map_id: String,
    pub map_description: String,
    pub position_initialized: bool,
    pub localization_score: f64,
    pub deviation_range: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatteryState {
    pub battery_charge: f64,
    pub battery_voltage: f64,
    pub battery_health: i64,
    pub charging: bool,
    pub reach: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyState {
    #[serde(rename = "eStop")]
    pub e_stop: String,
    pub field_violation: bool,
}

impl Default for SafetyState {
    fn default() -> Self {
        Self {
            e_stop: "NONE".to_string(),
            field_violation: false,
        }
    }
}

impl SafetyState {
    pub fn is_violated(&self) -> bool {
        self.e_stop != "NONE" || self.field_violation
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Velocity {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorInfo {
    pub error_type: String,
    pub error_description: String,
    pub error_level: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InfoMessage {
    pub info_type: String,
    pub info_description: String,
}

/// Factsheet document a robot publishes in response to a factsheet request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FactsheetMessage {
    pub header_id: u64,
    pub timestamp: String,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,
    pub agv_geometry: serde_json::Value,
    pub physical_parameters: PhysicalParameters,
    pub protocol_features: ProtocolFeatures,
    pub protocol_limits: ProtocolLimits,
    pub type_specification: TypeSpecification,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PhysicalParameters {
    pub acceleration_max: f64,
    pub deceleration_max: f64,
    pub height_max: f64,
    pub height_min: f64,
    pub length: f64,
    pub speed_max: f64,
    pub speed_min: f64,
    pub width: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProtocolFeatures {
    pub agv_actions: Vec<AgvActionSpec>,
    pub optional_parameters: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AgvActionSpec {
    pub action_description: String,
    pub action_parameters: Vec<ActionParameterSpec>,
    pub action_scopes: Vec<String>,
    pub action_type: String,
    pub result_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionParameterSpec {
    pub description: String,
    pub is_optional: bool,
    pub key: String,
    pub value_data_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLimits {
    #[serde(rename = "VDA5050ProtocolLimits")]
    pub vda5050_protocol_limits: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TypeSpecification {
    pub agv_class: String,
    pub agv_kinematics: String,
    pub localization_types: Vec<String>,
    pub max_load_mass: i64,
    pub navigation_types: Vec<String>,
    pub series_description: String,
    pub series_name: String,
}

// Outbound messages

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockingType {
    None,
    Soft,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub key: String,
    pub value: serde_json::Value,
}

impl ActionParameter {
    pub fn new(key: &str, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: String,
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_description: Option<String>,
    pub blocking_type: BlockingType,
    #[serde(default)]
    pub action_parameters: Vec<ActionParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    #[serde(rename = "allowedDeviationXY")]
    pub allowed_deviation_xy: f64,
    pub allowed_deviation_theta: f64,
    pub map_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub node_id: String,
    pub description: String,
    pub sequence_id: u64,
    pub released: bool,
    pub node_position: NodePosition,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub edge_id: String,
    pub sequence_id: u64,
    pub released: bool,
    pub start_node_id: String,
    pub end_node_id: String,
    pub actions: Vec<Action>,
}

/// Pose carried by the `initPosition` action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pose {
    pub last_node_id: String,
    pub map_id: String,
    pub theta: f64,
    pub x: f64,
    pub y: f64,
}

/// Message sent to a robot: either a list of instant actions or an order graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotActionMessage {
    pub header_id: u64,
    pub timestamp: String,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_update_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
}

impl RobotActionMessage {
    /// The first action type found, for logging.
    pub fn primary_action_type(&self) -> &str {
        self.actions
            .first()
            .or_else(|| self.nodes.iter().flat_map(|n| n.actions.iter()).next())
            .map_or("unknown", |a| a.action_type.as_str())
    }

    pub fn is_order(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// Inbound telemetry routed into the state store.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotUpdate {
    Connection(ConnectionMessage),
    State(Box<StateMessage>),
}

impl RobotUpdate {
    pub fn serial(&self) -> &str {
        match self {
            RobotUpdate::Connection(msg) => &msg.serial_number,
            RobotUpdate::State(msg) => &msg.serial_number,
        }
    }

    pub fn manufacturer(&self) -> &str {
        match self {
            RobotUpdate::Connection(msg) => &msg.manufacturer,
            RobotUpdate::State(msg) => &msg.manufacturer,
        }
    }

    pub fn header_id(&self) -> u64 {
        match self {
            RobotUpdate::Connection(msg) => msg.header_id,
            RobotUpdate::State(msg) => msg.header_id,
        }
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            RobotUpdate::Connection(msg) => Some(msg.connection_state),
            RobotUpdate::State(msg) => msg.connection_state,
        }
    }
}

fn check_size(payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    Ok(())
}

fn validate_header(serial: &str, manufacturer: &str, version: &str) -> Result<(), ProtocolError> {
    if serial.is_empty() {
        return Err(ProtocolError::MissingField("serialNumber"));
    }
    if manufacturer.is_empty() {
        return Err(ProtocolError::MissingField("manufacturer"));
    }
    if version.is_empty() {
        return Err(ProtocolError::MissingField("version"));
    }
    Ok(())
}

pub fn decode_connection(payload: &[u8]) -> Result<ConnectionMessage, ProtocolError> {
    check_size(payload)?;
    let msg: ConnectionMessage = serde_json::from_slice(payload)?;
    validate_header(&msg.serial_number, &msg.manufacturer, &msg.version)?;
    Ok(msg)
}

pub fn decode_state(payload: &[u8]) -> Result<StateMessage, ProtocolError> {
    check_size(payload)?;
    let msg: StateMessage = serde_json::from_slice(payload)?;
    validate_header(&msg.serial_number, &msg.manufacturer, &msg.version)?;
    Ok(msg)
}

pub fn decode_factsheet(payload: &[u8]) -> Result<FactsheetMessage, ProtocolError> {
    check_size(payload)?;
    let msg: FactsheetMessage = serde_json::from_slice(payload)?;
    if msg.serial_number.is_empty() {
        return Err(ProtocolError::MissingField("serialNumber"));
    }
    if msg.version.is_empty() {
        return Err(ProtocolError::MissingField("version"));
    }
    Ok(msg)
}

/// Keys of the minimal connection schema.
const CONNECTION_KEYS: [&str; 6] = [
    "headerId",
    "timestamp",
    "version",
    "manufacturer",
    "serialNumber",
    "connectionState",
];

/// Decode a payload received on the connection topic.
///
/// Any key outside the minimal connection schema selects the richer
/// telemetry schema. A document that fails the richer schema, or only
/// carries the connection header, is decoded as a connection message.
pub fn decode_connection_topic(payload: &[u8]) -> Result<RobotUpdate, ProtocolError> {
    check_size(payload)?;
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let extended = value
        .as_object()
        .is_some_and(|fields| fields.keys().any(|k| !CONNECTION_KEYS.contains(&k.as_str())));

    if extended {
        if let Ok(state) = decode_state(payload) {
            return Ok(RobotUpdate::State(Box::new(state)));
        }
    }
    decode_connection(payload).map(RobotUpdate::Connection)
}

/// A controller instruction from the command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerCommand {
    /// `None` for the legacy broadcast form (bare `init`).
    pub serial: Option<String>,
    pub command: String,
}

/// Parse `"<serial>:<command>"`. The command part may itself contain `:`.
pub fn parse_controller_command(payload: &[u8]) -> Result<ControllerCommand, ProtocolError> {
    check_size(payload)?;
    let text = core::str::from_utf8(payload)
        .map_err(|_| ProtocolError::InvalidCommand("payload is not UTF-8".to_string()))?
        .trim();

    match text.split_once(':') {
        Some((serial, command)) => {
            let serial = serial.trim();
            let command = command.trim();
            if serial.is_empty() || command.is_empty() {
                return Err(ProtocolError::InvalidCommand(format!(
                    "empty serial or command in '{text}'"
                )));
            }
            Ok(ControllerCommand {
                serial: Some(serial.to_string()),
                command: command.to_string(),
            })
        }
        None if text == "init" => Ok(ControllerCommand {
            serial: None,
            command: text.to_string(),
        }),
        None => Err(ProtocolError::InvalidCommand(format!(
            "expected 'serial:command', got '{text}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION: &str = r#"{"headerId":7,"timestamp":"2024-01-01T00:00:00Z","version":"2.0.0","manufacturer":"Roboligent","serialNumber":"DEX0001","connectionState":"ONLINE"}"#;

    #[test]
    fn test_decode_connection_message() {
        let msg = decode_connection(CONNECTION.as_bytes()).unwrap();
        assert_eq!(msg.header_id, 7);
        assert_eq!(msg.connection_state, ConnectionState::Online);
        assert_eq!(msg.serial_number, "DEX0001");
    }

    #[test]
    fn test_decode_connection_missing_version() {
        let json = r#"{"headerId":1,"manufacturer":"Roboligent","serialNumber":"DEX0001","connectionState":"OFFLINE"}"#;
        assert_eq!(
            decode_connection(json.as_bytes()),
            Err(ProtocolError::MissingField("version"))
        );
    }

    #[test]
    fn test_connection_topic_falls_back_to_minimal_schema() {
        let update = decode_connection_topic(CONNECTION.as_bytes()).unwrap();
        assert!(matches!(update, RobotUpdate::Connection(_)));
    }

    #[test]
    fn test_connection_topic_prefers_detailed_schema() {
        let json = r#"{"headerId":9,"version":"2.0.0","manufacturer":"Roboligent","serialNumber":"DEX0001",
            "connectionState":"ONLINE","driving":true,"batteryState":{"batteryCharge":80.5,"charging":false}}"#;
        match decode_connection_topic(json.as_bytes()).unwrap() {
            RobotUpdate::State(state) => {
                assert_eq!(state.driving, Some(true));
                assert_eq!(state.connection_state, Some(ConnectionState::Online));
                assert!((state.battery_state.unwrap().battery_charge - 80.5).abs() < f64::EPSILON);
            }
            other => panic!("expected detailed telemetry, got {other:?}"),
        }
    }

    #[test]
    fn test_connection_topic_extra_keys_select_detailed_schema() {
        let json = r#"{"headerId":3,"version":"2.0.0","manufacturer":"Roboligent","serialNumber":"DEX0001",
            "connectionState":"ONLINE","lastNodeSequenceId":4,"distanceSinceLastNode":1.5}"#;
        match decode_connection_topic(json.as_bytes()).unwrap() {
            RobotUpdate::State(state) => {
                assert_eq!(state.last_node_sequence_id, Some(4));
                assert_eq!(state.distance_since_last_node, Some(1.5));
                assert!(state.is_detailed());
            }
            other => panic!("expected detailed telemetry, got {other:?}"),
        }
    }

    #[test]
    fn test_connection_state_wire_names() {
        let broken: ConnectionState = serde_json::from_str("\"CONNECTIONBROKEN\"").unwrap();
        assert_eq!(broken, ConnectionState::ConnectionBroken);
        assert_eq!(serde_json::to_string(&ConnectionState::Offline).unwrap(), "\"OFFLINE\"");
    }

    #[test]
    fn test_parse_controller_command() {
        let cmd = parse_controller_command(b"DEX0002:I:pickA").unwrap();
        assert_eq!(cmd.serial.as_deref(), Some("DEX0002"));
        assert_eq!(cmd.command, "I:pickA");

        let cmd = parse_controller_command(b"  DEX0001 : init \n").unwrap();
        assert_eq!(cmd.serial.as_deref(), Some("DEX0001"));
        assert_eq!(cmd.command, "init");
    }

    #[test]
    fn test_parse_controller_command_errors() {
        for payload in ["badcommand", ":init", "DEX0001:", "", "  :  "] {
            assert!(
                matches!(
                    parse_controller_command(payload.as_bytes()),
                    Err(ProtocolError::InvalidCommand(_))
                ),
                "'{payload}' should not parse"
            );
        }
    }

    #[test]
    fn test_parse_legacy_broadcast_init() {
        let cmd = parse_controller_command(b"init").unwrap();
        assert!(cmd.serial.is_none());
        assert_eq!(cmd.command, "init");
    }

    #[test]
    fn test_node_position_uses_uppercase_xy_key() {
        let json = serde_json::to_value(NodePosition::default()).unwrap();
        assert!(json.get("allowedDeviationXY").is_some());
    }

    #[test]
    fn test_decode_factsheet() {
        let json = r#"{"headerId":1,"version":"2.0.0","manufacturer":"Roboligent","serialNumber":"DEX0001",
            "physicalParameters":{"Length":1.2,"Width":0.6},
            "protocolFeatures":{"AgvActions":[{"ActionType":"initPosition","ActionScopes":["INSTANT"]}]},
            "protocolLimits":{"VDA5050ProtocolLimits":["maxNodes"]}}"#;
        let msg = decode_factsheet(json.as_bytes()).unwrap();
        assert_eq!(msg.protocol_features.agv_actions.len(), 1);
        assert_eq!(msg.protocol_features.agv_actions[0].action_type, "initPosition");
        assert_eq!(msg.protocol_limits.vda5050_protocol_limits, vec!["maxNodes"]);
    }
}
