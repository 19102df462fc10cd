use std::{sync::Arc, time::Duration};

use crate::{catalog::Catalog, proto::Request, ratelimit::TokenBucket};

/// Why a request was refused before reaching the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    InvalidArgument(String),
    Unsupported(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "ratelimit reached"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Unsupported(cmd) => write!(f, "command not supported: {cmd}"),
        }
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub command: String,
    pub ordering_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AdmissionController {
    catalog: Arc<Catalog>,
    limiter: Arc<TokenBucket>,
    max_wait: Duration,
}

impl AdmissionController {
    pub fn new(catalog: Arc<Catalog>, limiter: Arc<TokenBucket>, max_wait: Duration) -> Self {
        Self {
            catalog,
            limiter,
            max_wait,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn admit(&self, req: &Request) -> Result<Admitted, Rejection> {
        if !self.limiter.acquire_within(self.max_wait).await {
            return Err(Rejection::RateLimited);
        }

        if req.args.is_empty() {
            return Err(Rejection::InvalidArgument(
                "at least one argument is required".to_string(),
            ));
        }

        let command = req.cmd.to_ascii_lowercase();
        let Some(desc) = self.catalog.resolve(&command) else {
            return Err(Rejection::Unsupported(command));
        };

        if !desc.accepts_arg_count(req.args.len()) {
            return Err(Rejection::InvalidArgument(format!(
                "wrong number of arguments for {command}: got {}, arity {}",
                req.args.len() + 1,
                desc.arity
            )));
        }

        // The catalog guarantees the position fits every accepted arity.
        let Some(key) = req.args.get(desc.first_key_position - 1) else {
            return Err(Rejection::InvalidArgument(format!(
                "missing key argument for {command}"
            )));
        };

        Ok(Admitted {
            ordering_key: key.clone(),
            command,
        })
    }
}
