//! HostMesh Core Library
//!
//! Core types, configuration, and utilities shared by the HostMesh messaging
//! and cluster membership crates.

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::MeshConfig;
pub use error::{Error, Result};

/// HostMesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default internal (mesh) port
pub const DEFAULT_INTERNAL_PORT: u16 = 3021;

/// Maximum number of distinct software versions allowed in one mesh
pub const MAX_ACTIVE_VERSIONS: usize = 2;

/// Maximum size of a single wire frame (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum size of a join handshake JSON document (1 MiB)
pub const MAX_HANDSHAKE_SIZE: usize = 1024 * 1024;
