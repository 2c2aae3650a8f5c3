//! # IRP Client Library (irp-client)
//!
//! Client-side coordination for the investment-report platform.
//!
//! **Purpose:** Validate and upload IR documents with bounded concurrency,
//! drive the analysis session (submit, poll, follow-ups), and receive row
//! changes over the realtime channel.
//!
//! **Architecture:** Services behind small async traits (`TokenIssuer`,
//! `BlobTransport`, `AnalysisApi`, `RealtimeConnector`) so each can run
//! against the HTTP backend or an in-memory fake.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use error::{BatchError, ClientError, ClientResult, RealtimeError};
