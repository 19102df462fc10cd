//! The key-value store that replayed commands are applied to.

use async_trait::async_trait;
use bytes::Bytes;

use crate::catalog::CommandDescriptor;

pub mod resp;

pub use resp::{Frame, RedisOptions, RedisStore, RespCodec};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Protocol(String),
    /// The store executed the command and answered with an error reply.
    Command(String),
    UnexpectedReply(String),
    Timeout,
    ConnectionClosed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store io error: {e}"),
            Self::Protocol(msg) => write!(f, "store protocol error: {msg}"),
            Self::Command(msg) => write!(f, "store command error: {msg}"),
            Self::UnexpectedReply(msg) => write!(f, "unexpected store reply: {msg}"),
            Self::Timeout => write!(f, "store request timed out"),
            Self::ConnectionClosed => write!(f, "store connection closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str, args: &[Bytes]) -> Result<Frame, StoreError>;

    /// The store's command table: name, arity and first key position.
    async fn introspect_commands(&self) -> Result<Vec<CommandDescriptor>, StoreError>;
}
