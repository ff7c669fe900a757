//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod manifest;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use manifest::execute as manifest;
