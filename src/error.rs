use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::translator::TranslateError;

/// Top-level error for anything that crosses the bridge boundary.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection failed after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },
    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("publish to {topic} timed out after {timeout:?}")]
    PublishTimeout {
        topic: String,
        timeout: std::time::Duration,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected to broker")]
    NotConnected,
    #[error("operation cancelled by shutdown")]
    Cancelled,
    #[error("robot {0} is not on the target roster")]
    NotTarget(String),
    #[error("robot {0} is not online")]
    RobotOffline(String),
    #[error("bridge already started")]
    AlreadyStarted,
    #[error("no tokio runtime available")]
    NoRuntime,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Errors raised by the transport layer, as opposed to input rejections.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectFailed { .. }
                | BridgeError::ConnectTimeout(_)
                | BridgeError::PublishTimeout { .. }
                | BridgeError::Transport(_)
                | BridgeError::NotConnected
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
