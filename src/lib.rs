pub mod admission;
pub mod catalog;
pub mod config;
pub mod http;
pub mod log;
pub mod logging;
pub mod metrics;
pub mod proto;
pub mod proxy;
pub mod publisher;
pub mod ratelimit;
pub mod replay;
pub mod retry;
pub mod service;
pub mod store;
pub mod version;
