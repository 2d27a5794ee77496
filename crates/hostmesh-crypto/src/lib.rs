//! Cryptography utilities for HostMesh

pub mod cipher;
pub mod hash;

pub use cipher::*;
pub use hash::*;
