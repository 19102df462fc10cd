use std::sync::Arc;

use prost::Message as _;

use crate::{
    log::{Appended, LogError, LogProducer},
    proto::Request,
};

#[derive(Debug)]
pub enum PublishError {
    PayloadTooLarge { size: usize, max: usize },
    Log(LogError),
    Timeout,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { size, max } => {
                write!(f, "request size {size} exceeds limit {max}")
            }
            Self::Log(e) => write!(f, "publish failed: {e}"),
            Self::Timeout => write!(f, "publish timed out"),
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Log(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LogError> for PublishError {
    fn from(value: LogError) -> Self {
        Self::Log(value)
    }
}

/// Serializes admitted requests and appends them to the log, keyed by their
/// ordering key.
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn LogProducer>,
    topic: String,
    max_request_bytes: usize,
}

impl Publisher {
    pub fn new(producer: Arc<dyn LogProducer>, topic: String, max_request_bytes: usize) -> Self {
        Self {
            producer,
            topic,
            max_request_bytes,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, req: &Request, key: &[u8]) -> Result<Appended, PublishError> {
        let size = req.encoded_len();
        if size > self.max_request_bytes {
            return Err(PublishError::PayloadTooLarge {
                size,
                max: self.max_request_bytes,
            });
        }
        let payload = req.encode_to_vec();
        Ok(self.producer.append(&self.topic, key, &payload).await?)
    }
}
