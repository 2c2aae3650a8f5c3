//! # IRP Common Library
//!
//! Shared code for the IR platform client crates:
//! - Error and Result types
//! - TOML configuration loading and resolution
//! - Client event types (ClientEvent enum) and the EventBus
//! - Backend response envelope decoding

pub mod api;
pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
