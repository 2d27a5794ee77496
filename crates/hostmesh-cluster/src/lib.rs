//! HostMesh Cluster - mesh join, connections and membership
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       HostMessenger                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌───────────────┐    │
//! │  │ SocketJoiner  │  │   Acceptor    │  │  Registries   │    │
//! │  │               │  │               │  │               │    │
//! │  │ - Leader race │  │ - Host ids    │  │ - Hosts (COW) │    │
//! │  │ - Topology    │  │ - Versions    │  │ - Mailboxes   │    │
//! │  │ - Clock skew  │  │ - Sub-conns   │  │ - Failed      │    │
//! │  └───────┬───────┘  └───────┬───────┘  └───────┬───────┘    │
//! │          │                  │                  │            │
//! │          └──────────────────┼──────────────────┘            │
//! │                             │                               │
//! │                    ┌────────┴────────┐                      │
//! │                    │   RemoteHost    │  events ──► failures │
//! │                    │ 1..N sub-conns  │           partition  │
//! │                    └─────────────────┘           decision   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Leader election by bind race**: the host that binds the lowest
//!   coordinator address leads and hands out host ids
//! - **Full mesh**: every host keeps 1..N ordered sub-connections to every
//!   other host
//! - **Failure detection**: socket loss and heartbeat silence both fail a host
//! - **Partition detection**: a minority fragment shuts itself down
//! - **Fault propagation**: failures witnessed elsewhere reach every survivor

mod acceptor;
mod connection;
mod error;
mod fatal;
mod handshake;
mod heartbeat;
mod joiner;
mod messenger;
mod partition;
mod registry;
mod remote_host;

pub mod coordinator;
pub mod fault;

pub use coordinator::{
    CoordinateStore, CreateMode, HostMetadata, InMemoryCoordinateStore, InstanceId,
};
pub use error::{ClusterError, ClusterResult};
pub use fatal::{FatalHandler, ProcessExit, RecordingFatalHandler};
pub use fault::{FaultPropagator, FaultSink, LoggingFaultSink, RecordingFaultSink};
pub use messenger::{HostMessenger, HostMessengerBuilder};
pub use partition::decide;
pub use registry::CowMap;
pub use remote_host::RemoteHost;
