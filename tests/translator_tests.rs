use std::collections::HashSet;

use agv_bridge::protocol::{BlockingType, NodePosition};
use agv_bridge::topic::OutboundChannel;
use agv_bridge::translator::{RobotCommand, TranslateError, TrajectoryTarget, Translator};

#[test]
fn test_init_produces_single_zero_pose_action() {
    let translator = Translator::default();
    let msg = translator.translate("init", "R1").unwrap();

    assert_eq!(msg.serial_number, "R1");
    assert_eq!(msg.manufacturer, "Roboligent");
    assert_eq!(msg.version, "2.0.0");
    assert!(msg.nodes.is_empty());
    assert!(msg.order_id.is_none());
    assert_eq!(msg.actions.len(), 1);

    let action = &msg.actions[0];
    assert_eq!(action.action_type, "initPosition");
    assert_eq!(action.blocking_type, BlockingType::None);
    assert!(!action.action_id.is_empty());
    assert_eq!(action.action_parameters.len(), 1);
    assert_eq!(action.action_parameters[0].key, "pose");

    let pose = &action.action_parameters[0].value;
    assert_eq!(pose["x"], 0.0);
    assert_eq!(pose["y"], 0.0);
    assert_eq!(pose["theta"], 0.0);
    assert_eq!(pose["mapId"], "");
    assert_eq!(pose["lastNodeId"], "");
}

#[test]
fn test_successive_messages_have_unique_ids_and_increasing_headers() {
    let translator = Translator::default();
    let first = translator.translate("init", "R1").unwrap();
    let second = translator.translate("init", "R1").unwrap();

    assert_ne!(first.actions[0].action_id, second.actions[0].action_id);
    assert!(second.header_id > first.header_id);
}

#[test]
fn test_header_counter_is_shared_across_robots() {
    let translator = Translator::default();
    let mut last = 0;
    for (i, command) in ["init", "factsheetRequest", "I:pick", "T:wave", "cancelOrder"]
        .iter()
        .enumerate()
    {
        let serial = if i % 2 == 0 { "R1" } else { "R2" };
        let msg = translator.translate(command, serial).unwrap();
        assert!(msg.header_id > last, "{command} did not advance the header id");
        last = msg.header_id;
    }
}

#[test]
fn test_header_counter_under_concurrency() {
    let translator = Translator::default();
    let ids = std::sync::Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..25 {
                    let msg = translator.translate("init", "R1").unwrap();
                    ids.lock().unwrap().push(msg.header_id);
                }
            });
        }
    });

    let ids = ids.into_inner().unwrap();
    let unique: HashSet<u64> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 100);
}

#[test]
fn test_empty_parametric_names_are_errors() {
    let translator = Translator::default();
    for command in ["I:", "T:", "inference:", "trajectory:", "I:   "] {
        assert!(
            matches!(
                translator.translate(command, "R1"),
                Err(TranslateError::EmptyName(_))
            ),
            "{command} should be rejected"
        );
    }
}

#[test]
fn test_unsupported_command() {
    let translator = Translator::default();
    let before = translator.last_header_id();
    let err = translator.translate("fly", "R1").unwrap_err();
    assert_eq!(err, TranslateError::Unsupported("fly".to_string()));
    assert_eq!(translator.last_header_id(), before);
}

#[test]
fn test_inference_order_graph() {
    let translator = Translator::default();
    let msg = translator.translate("I:pickA", "DEX0002").unwrap();

    assert!(msg.actions.is_empty());
    assert!(msg.is_order());
    assert_eq!(msg.order_update_id, Some(0));
    assert_eq!(msg.order_id.as_ref().map(String::len), Some(32));
    assert_eq!(msg.nodes.len(), 2);
    assert_eq!(msg.edges.len(), 1);

    let home = &msg.nodes[0];
    assert_eq!(home.node_id, "intermediate_node_0_0");
    assert_eq!(home.sequence_id, 0);
    assert!(home.actions.is_empty());
    assert_eq!(home.node_position.x, 0.0);
    assert_eq!(home.node_position.map_id, "floor 0");
    assert_eq!(
        home.description,
        "intermediate point 0 of task inference-pickA subtask index 0"
    );

    let target = &msg.nodes[1];
    assert_eq!(target.sequence_id, 2);
    assert_eq!(target.node_position.x, -4.16);
    assert_eq!(target.node_position.y, -0.39);
    assert_eq!(target.node_position.allowed_deviation_xy, 0.5);
    assert_eq!(target.actions.len(), 1);
    assert_eq!(target.actions[0].action_type, "Roboligent Robin - Inference");
    assert_eq!(target.actions[0].action_parameters[0].key, "inference_name");
    assert_eq!(target.actions[0].action_parameters[0].value, "pickA");

    let edge = &msg.edges[0];
    assert_eq!(edge.edge_id, "intermediate_edge_0_0");
    assert_eq!(edge.sequence_id, 1);
    assert_eq!(edge.start_node_id, home.node_id);
    assert_eq!(edge.end_node_id, target.node_id);
    assert_ne!(target.node_id, target.actions[0].action_id);
}

#[test]
fn test_trajectory_order_carries_arm_and_name() {
    let translator = Translator::default();
    let msg = translator.translate("trajectory:wave", "R1").unwrap();

    let action = &msg.nodes[1].actions[0];
    assert_eq!(action.action_type, "Roboligent Robin - Follow Trajectory");
    let params: Vec<(&str, &serde_json::Value)> = action
        .action_parameters
        .iter()
        .map(|p| (p.key.as_str(), &p.value))
        .collect();
    assert_eq!(params[0], ("arm", &serde_json::json!("right")));
    assert_eq!(params[1], ("trajectory_name", &serde_json::json!("wave")));
}

#[test]
fn test_configurable_trajectory() {
    let translator = Translator::default();
    let target = TrajectoryTarget {
        position: NodePosition {
            x: 2.0,
            y: 3.0,
            theta: 1.0,
            allowed_deviation_xy: 0.2,
            allowed_deviation_theta: 0.1,
            map_id: "floor 1".to_string(),
        },
        arm: "left".to_string(),
    };

    let msg = translator
        .configurable_trajectory("R1", "sweep", target.clone())
        .unwrap();
    assert_eq!(msg.nodes[1].node_position, target.position);
    assert_eq!(msg.nodes[1].actions[0].action_parameters[0].value, "left");

    assert!(translator
        .configurable_trajectory("R1", " ", TrajectoryTarget::default())
        .is_err());
}

#[test]
fn test_cancel_order_is_hard_blocking_on_orders_topic() {
    let translator = Translator::default();
    let msg = translator.translate("cancelOrder", "R1").unwrap();
    assert_eq!(msg.actions.len(), 1);
    assert_eq!(msg.actions[0].action_type, "cancelOrder");
    assert_eq!(msg.actions[0].blocking_type, BlockingType::Hard);
    assert_eq!(RobotCommand::CancelOrder.channel(), OutboundChannel::Orders);
}

#[test]
fn test_factsheet_request_uses_robot_manufacturer() {
    let translator = Translator::default();
    let msg = translator.build(&RobotCommand::FactsheetRequest, "R1", Some("Acme"));
    assert_eq!(msg.manufacturer, "Acme");
    assert_eq!(msg.actions[0].action_type, "factsheetRequest");
    assert!(msg.actions[0].action_parameters.is_empty());

    let fallback = translator.build(&RobotCommand::FactsheetRequest, "R1", Some(""));
    assert_eq!(fallback.manufacturer, "Roboligent");
}

#[test]
fn test_wire_format_keys() {
    let translator = Translator::default();
    let instant = serde_json::to_value(translator.translate("init", "R1").unwrap()).unwrap();
    assert!(instant.get("headerId").is_some());
    assert!(instant.get("serialNumber").is_some());
    assert_eq!(instant["actions"][0]["blockingType"], "NONE");
    assert!(instant.get("nodes").is_none());
    assert!(instant.get("orderId").is_none());

    let order = serde_json::to_value(translator.translate("I:x", "R1").unwrap()).unwrap();
    assert!(order.get("actions").is_none());
    assert_eq!(order["nodes"][0]["nodePosition"]["allowedDeviationXY"], 0.5);
    assert_eq!(order["edges"][0]["startNodeId"], "intermediate_node_0_0");
    assert!(order["timestamp"].as_str().unwrap().ends_with('Z'));
}
