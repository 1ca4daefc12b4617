use crate::types::{CommandPath, ImStatus, NodeId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;
use tracing::error;

/// What the device sent back for one command or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: ImStatus,
    /// Raw encoded response envelope, if the interaction carries one.
    pub response: Option<Vec<u8>>,
}

impl CommandReply {
    pub fn status(status: ImStatus) -> Self {
        Self {
            status,
            response: None,
        }
    }

    pub fn with_response(status: ImStatus, response: Vec<u8>) -> Self {
        Self {
            status,
            response: Some(response),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No session with node {0}")]
    NotConnected(NodeId),

    #[error("Transport failure {code:#x}: {message}")]
    Failure { code: u32, message: String },
}

impl TransportError {
    /// Numeric code handed to the error callback.
    pub fn code(&self) -> u32 {
        match self {
            TransportError::NotConnected(_) => u32::from(ImStatus::UnsupportedNode.code()),
            TransportError::Failure { code, .. } => *code,
        }
    }
}

/// Sends one encoded payload to a device and waits for its reply.
pub trait Transport {
    fn invoke(
        &mut self,
        destination: NodeId,
        path: &CommandPath,
        payload: &[u8],
    ) -> Result<CommandReply, TransportError>;
}

/// Transport backed by a closure simulating the device in this process.
///
/// A panic inside the closure is treated as the device going silent and yields a
/// `Timeout` reply.
pub struct InProcessTransport<F>
where
    F: FnMut(NodeId, &CommandPath, &[u8]) -> Result<CommandReply, TransportError>,
{
    device_fn: F,
}

impl<F> InProcessTransport<F>
where
    F: FnMut(NodeId, &CommandPath, &[u8]) -> Result<CommandReply, TransportError>,
{
    pub fn new(device_fn: F) -> Self {
        Self { device_fn }
    }
}

impl<F> Transport for InProcessTransport<F>
where
    F: FnMut(NodeId, &CommandPath, &[u8]) -> Result<CommandReply, TransportError>,
{
    fn invoke(
        &mut self,
        destination: NodeId,
        path: &CommandPath,
        payload: &[u8],
    ) -> Result<CommandReply, TransportError> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            (self.device_fn)(destination, path, payload)
        }));

        match result {
            Ok(reply) => reply,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic type".to_string()
                };
                error!(%path, destination, panic = %msg, "simulated device panicked");
                Ok(CommandReply::status(ImStatus::Timeout))
            }
        }
    }
}
