//! Converts controller commands into robot instant actions and order graphs.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::protocol::{
    Action, ActionParameter, BlockingType, Edge, Node, NodePosition, Pose, RobotActionMessage,
    PROTOCOL_VERSION,
};
use crate::topic::{OutboundChannel, DEFAULT_MANUFACTURER};

const MAP_ID: &str = "floor 0";
const ALLOWED_DEVIATION_XY: f64 = 0.5;
// 10 degrees
const ALLOWED_DEVIATION_THETA: f64 = 0.174_532_92;

const TASK_X: f64 = -4.16;
const TASK_Y: f64 = -0.39;
#[allow(clippy::approx_constant)]
const TASK_THETA: f64 = 3.141_592_7;

const INTERMEDIATE_NODE_ID: &str = "intermediate_node_0_0";
const INTERMEDIATE_EDGE_ID: &str = "intermediate_edge_0_0";

const INFERENCE_ACTION_TYPE: &str = "Roboligent Robin - Inference";
const INFERENCE_ACTION_DESCRIPTION: &str =
    "This is an action will trigger the behavior tree for executing inference.";
const TRAJECTORY_ACTION_TYPE: &str = "Roboligent Robin - Follow Trajectory";
const TRAJECTORY_ACTION_DESCRIPTION: &str =
    "This action will trigger the behavior tree for following a recorded trajectory.";

pub const DEFAULT_ARM: &str = "right";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("unsupported command: {0}")]
    Unsupported(String),
    #[error("{0} name is required")]
    EmptyName(&'static str),
}

/// A controller command after grammar checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotCommand {
    Init,
    FactsheetRequest,
    CancelOrder,
    Inference(String),
    Trajectory(String),
}

impl RobotCommand {
    /// Accepts `init`, `factsheetRequest`, `cancelOrder`, `I:<name>` /
    /// `inference:<name>` and `T:<name>` / `trajectory:<name>`.
    pub fn parse(command: &str) -> Result<Self, TranslateError> {
        let command = command.trim();
        match command {
            "init" => return Ok(RobotCommand::Init),
            "factsheetRequest" => return Ok(RobotCommand::FactsheetRequest),
            "cancelOrder" => return Ok(RobotCommand::CancelOrder),
            _ => {}
        }

        if let Some(name) = strip_any_prefix(command, &["I:", "inference:"]) {
            return named(name, "inference").map(RobotCommand::Inference);
        }
        if let Some(name) = strip_any_prefix(command, &["T:", "trajectory:"]) {
            return named(name, "trajectory").map(RobotCommand::Trajectory);
        }

        Err(TranslateError::Unsupported(command.to_string()))
    }

    pub fn channel(&self) -> OutboundChannel {
        match self {
            RobotCommand::Init | RobotCommand::FactsheetRequest => OutboundChannel::InstantActions,
            RobotCommand::CancelOrder | RobotCommand::Inference(_) | RobotCommand::Trajectory(_) => {
                OutboundChannel::Orders
            }
        }
    }
}

impl fmt::Display for RobotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RobotCommand::Init => write!(f, "init"),
            RobotCommand::FactsheetRequest => write!(f, "factsheetRequest"),
            RobotCommand::CancelOrder => write!(f, "cancelOrder"),
            RobotCommand::Inference(name) => write!(f, "inference:{name}"),
            RobotCommand::Trajectory(name) => write!(f, "trajectory:{name}"),
        }
    }
}

fn strip_any_prefix<'a>(command: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| command.strip_prefix(p))
}

fn named(name: &str, kind: &'static str) -> Result<String, TranslateError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TranslateError::EmptyName(kind));
    }
    Ok(name.to_string())
}

/// Where a trajectory order should end and which arm performs it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryTarget {
    pub position: NodePosition,
    pub arm: String,
}

impl Default for TrajectoryTarget {
    fn default() -> Self {
        Self {
            position: task_position(),
            arm: DEFAULT_ARM.to_string(),
        }
    }
}

fn home_position() -> NodePosition {
    NodePosition {
        x: 0.0,
        y: 0.0,
        theta: 0.0,
        allowed_deviation_xy: ALLOWED_DEVIATION_XY,
        allowed_deviation_theta: ALLOWED_DEVIATION_THETA,
        map_id: MAP_ID.to_string(),
    }
}

fn task_position() -> NodePosition {
    NodePosition {
        x: TASK_X,
        y: TASK_Y,
        theta: TASK_THETA,
        allowed_deviation_xy: ALLOWED_DEVIATION_XY,
        allowed_deviation_theta: ALLOWED_DEVIATION_THETA,
        map_id: MAP_ID.to_string(),
    }
}

/// Random 32-char hex identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Builds outbound messages. One instance is shared process-wide so header
/// ids increase strictly across every robot.
#[derive(Debug)]
pub struct Translator {
    header_counter: AtomicU64,
    manufacturer: String,
    version: String,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new(DEFAULT_MANUFACTURER, PROTOCOL_VERSION)
    }
}

impl Translator {
    pub fn new(manufacturer: &str, version: &str) -> Self {
        Self {
            header_counter: AtomicU64::new(1),
            manufacturer: manufacturer.to_string(),
            version: version.to_string(),
        }
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    /// Most recently issued header id.
    pub fn last_header_id(&self) -> u64 {
        self.header_counter.load(Ordering::SeqCst)
    }

    fn next_header_id(&self) -> u64 {
        self.header_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn translate(&self, command: &str, serial: &str) -> Result<RobotActionMessage, TranslateError> {
        let parsed = RobotCommand::parse(command)?;
        Ok(self.build(&parsed, serial, None))
    }

    /// Build the message for an already-parsed command.
    ///
    /// `robot_manufacturer` is only honoured for factsheet requests, which
    /// must address the manufacturer the robot reported itself under.
    pub fn build(
        &self,
        command: &RobotCommand,
        serial: &str,
        robot_manufacturer: Option<&str>,
    ) -> RobotActionMessage {
        match command {
            RobotCommand::Init => {
                let action = Action {
                    action_type: "initPosition".to_string(),
                    action_id: generate_id(),
                    action_description: None,
                    blocking_type: BlockingType::None,
                    action_parameters: vec![ActionParameter::new("pose", pose_value(&Pose::default()))],
                };
                self.instant(serial, &self.manufacturer, action)
            }
            RobotCommand::FactsheetRequest => {
                let manufacturer = robot_manufacturer
                    .filter(|m| !m.is_empty())
                    .unwrap_or(self.manufacturer.as_str());
                let action = Action {
                    action_type: "factsheetRequest".to_string(),
                    action_id: generate_id(),
                    action_description: None,
                    blocking_type: BlockingType::None,
                    action_parameters: Vec::new(),
                };
                self.instant(serial, manufacturer, action)
            }
            RobotCommand::CancelOrder => {
                let action = Action {
                    action_type: "cancelOrder".to_string(),
                    action_id: generate_id(),
                    action_description: None,
                    blocking_type: BlockingType::Hard,
                    action_parameters: Vec::new(),
                };
                self.instant(serial, &self.manufacturer, action)
            }
            RobotCommand::Inference(name) => {
                let action = Action {
                    action_type: INFERENCE_ACTION_TYPE.to_string(),
                    action_id: generate_id(),
                    action_description: Some(INFERENCE_ACTION_DESCRIPTION.to_string()),
                    blocking_type: BlockingType::None,
                    action_parameters: vec![ActionParameter::new("inference_name", name.as_str())],
                };
                self.order(serial, &format!("inference-{name}"), task_position(), action)
            }
            RobotCommand::Trajectory(name) => {
                self.trajectory_order(serial, name, TrajectoryTarget::default())
            }
        }
    }

    /// Trajectory order with a caller-chosen end pose and arm.
    pub fn configurable_trajectory(
        &self,
        serial: &str,
        name: &str,
        target: TrajectoryTarget,
    ) -> Result<RobotActionMessage, TranslateError> {
        let name = named(name, "trajectory")?;
        Ok(self.trajectory_order(serial, &name, target))
    }

    fn trajectory_order(&self, serial: &str, name: &str, target: TrajectoryTarget) -> RobotActionMessage {
        let action = Action {
            action_type: TRAJECTORY_ACTION_TYPE.to_string(),
            action_id: generate_id(),
            action_description: Some(TRAJECTORY_ACTION_DESCRIPTION.to_string()),
            blocking_type: BlockingType::None,
            action_parameters: vec![
                ActionParameter::new("arm", target.arm.as_str()),
                ActionParameter::new("trajectory_name", name),
            ],
        };
        self.order(serial, &format!("trajectory-{name}"), target.position, action)
    }

    fn base(&self, serial: &str, manufacturer: &str) -> RobotActionMessage {
        RobotActionMessage {
            header_id: self.next_header_id(),
            timestamp: timestamp_now(),
            version: self.version.clone(),
            manufacturer: manufacturer.to_string(),
            serial_number: serial.to_string(),
            actions: Vec::new(),
            order_id: None,
            order_update_id: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn instant(&self, serial: &str, manufacturer: &str, action: Action) -> RobotActionMessage {
        let mut msg = self.base(serial, manufacturer);
        msg.actions.push(action);
        msg
    }

    // Two nodes joined by one edge: home (seq 0) -> edge (seq 1) -> target (seq 2).
    fn order(&self, serial: &str, task: &str, target: NodePosition, action: Action) -> RobotActionMessage {
        let target_id = generate_id();

        let intermediate = Node {
            node_id: INTERMEDIATE_NODE_ID.to_string(),
            description: format!("intermediate point 0 of task {task} subtask index 0"),
            sequence_id: 0,
            released: true,
            node_position: home_position(),
            actions: Vec::new(),
        };
        let target_node = Node {
            node_id: target_id.clone(),
            description: format!("we are in 2 Subtask of {task} at index 0"),
            sequence_id: 2,
            released: true,
            node_position: target,
            actions: vec![action],
        };
        let edge = Edge {
            edge_id: INTERMEDIATE_EDGE_ID.to_string(),
            sequence_id: 1,
            released: true,
            start_node_id: INTERMEDIATE_NODE_ID.to_string(),
            end_node_id: target_id,
            actions: Vec::new(),
        };

        let mut msg = self.base(serial, &self.manufacturer);
        msg.order_id = Some(generate_id());
        msg.order_update_id = Some(0);
        msg.nodes = vec![intermediate, target_node];
        msg.edges = vec![edge];
        msg
    }
}

fn pose_value(pose: &Pose) -> serde_json::Value {
    serde_json::json!({
        "lastNodeId": pose.last_node_id,
        "mapId": pose.map_id,
        "theta": pose.theta,
        "x": pose.x,
        "y": pose.y,
    })
}
