//! Core building blocks shared across rudder crates.
//!
//! This crate provides:
//! - Default configuration values
//! - The bidirectional splice used by every proxied connection

pub mod defaults;
pub mod io;

pub use io::{splice, SpliceStats};

/// Project name.
pub const PROJECT_NAME: &str = "rudder";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
