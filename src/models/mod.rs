//! Core data models for the harvesting pipeline.
//!
//! Servers are the remote endpoints we poll; files are the remote entries we
//! track from discovery through download and the later delivery stages.
//! Both map to database tables via `sqlx::FromRow` and serialize as JSON via
//! `serde`.

pub mod file;
pub mod server;
