//! Stagebuild - manifest-driven application builder
//!
//! Builds an application directory through a fixed sequence of stages and
//! snapshots every stage into a content-addressed store, so unchanged
//! stages are restored instead of rebuilt.

pub mod builder;
pub mod cache;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod manifest;
pub mod store;
pub mod ui;

pub use error::{BuildError, BuildResult};
