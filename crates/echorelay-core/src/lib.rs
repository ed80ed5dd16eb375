//! `EchoRelay` Core Library
//!
//! Shared functionality for the relay:
//! - Topic naming and validation rules
//! - Outbound response envelope
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod envelope;
pub mod error;
pub mod topic;
pub mod tracing_init;

pub use config::Config;
pub use envelope::ResponseEnvelope;
pub use error::{Error, Result};
