//! Core types for HostMesh

mod ids;
mod topology;
mod version;

pub use ids::*;
pub use topology::*;
pub use version::*;
