//! # robotrpc-server
//!
//! HTTP host for the robot RPC protocol.
//!
//! This crate provides:
//! - An HTTP/1.1 endpoint accepting robot call envelopes
//! - Dispatch of every robot function to the in-memory host
//! - A message injection endpoint for answering prompts
//! - YAML configuration with environment overrides
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;

pub use config::{BrainConfig, Config, ConfigError, MetricsConfig, NetworkConfig, PromptConfig};
pub use error::ServerError;
pub use handler::RequestHandler;
pub use metrics::Metrics;
pub use server::{Server, ServerConfig};
