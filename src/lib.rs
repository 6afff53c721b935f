//! # AGV Fleet Bridge
//!
//! A protocol bridge between a factory controller (PLC) and a fleet of mobile
//! robots speaking a VDA5050-style JSON protocol over publish/subscribe.
//!
//! ## Features
//!
//! - **Fleet state tracking**: Per-robot connection and telemetry registry with
//!   stale-message rejection by `headerId`
//! - **Command translation**: Plain-text controller commands become instant
//!   actions or two-node order graphs
//! - **Connection lifecycle**: Bounded-retry connect, resubscription on every
//!   reconnect, publish with timeout and a health check loop
//! - **Automated workflows**: Robots coming online are initialised and asked
//!   for their factsheet after configurable delays
//! - **Pluggable transport**: Any pub/sub client behind the [`Transport`] trait
//!
//! ## Quick Start
//!
//! ```rust
//! use agv_bridge::protocol::parse_controller_command;
//! use agv_bridge::Translator;
//!
//! let cmd = parse_controller_command(b"DEX0002:I:pickA").unwrap();
//! assert_eq!(cmd.serial.as_deref(), Some("DEX0002"));
//!
//! let translator = Translator::default();
//! let order = translator.translate(&cmd.command, "DEX0002").unwrap();
//! assert_eq!(order.nodes.len(), 2);
//! assert_eq!(order.edges.len(), 1);
//! ```
//!
//! ## Architecture
//!
//! Data flows transport → router → store → workflow → translator → connection:
//!
//! - [`topic`] - Topic grammar for robot and controller channels
//! - [`protocol`] - Wire types, decoding and validation
//! - [`translator`] - Command to protocol message conversion
//! - [`store`] - Robot state registry and transition listeners
//! - [`connection`] - Broker connection lifecycle
//! - [`router`] - Inbound message demultiplexing
//! - [`dispatch`] - Outbound command path
//! - [`workflow`] - Auto-init on robot connect
//! - [`bridge`] - Composition root

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod router;
pub mod store;
pub mod topic;
pub mod translator;
pub mod transport;
pub mod workflow;

// Re-export main public types for convenience
pub use bridge::{Bridge, StatusReport};
pub use config::{BridgeConfig, ConfigError, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use error::{BridgeError, Result};
pub use protocol::{ConnectionState, ProtocolError};
pub use store::{RobotRecord, RobotStateStore, StateTransition, TransitionListener};
pub use translator::{RobotCommand, TranslateError, Translator};
pub use transport::{InMemoryTransport, QoS, Transport, TransportEvent};
