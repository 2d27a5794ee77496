//! HostMesh Messaging
//!
//! Typed binary messages exchanged between mailboxes on different hosts.
//!
//! ```text
//! ┌───────────────┐  send   ┌────────────────┐  Frame  ┌──────────────┐
//! │  SiteMailbox  │ ──────► │ MessageRouter  │ ──────► │  FrameCodec  │ ──► socket
//! └───────────────┘         └────────────────┘         └──────────────┘
//!         ▲                                                    │
//!         │ deliver        ┌────────────────┐   payload bytes  │
//!         └─────────────── │ MessageFactory │ ◄────────────────┘
//!                          └────────────────┘
//! ```
//!
//! Message bytes are `[type tag:1][subject:1][body]`. The frame carries the
//! source and destination HSIds, so those are not repeated in the body.

pub mod error;
pub mod factory;
pub mod frame;
pub mod mailbox;
pub mod message;
pub mod subject;

pub use error::{MailboxError, WireError, WireResult};
pub use factory::{DecodeFn, MessageFactory};
pub use frame::{Frame, FrameCodec, PoisonCause, DEST_COUNT_POISON_PILL, DEST_COUNT_STOPNODE};
pub use mailbox::{Mailbox, MessageRouter, SiteMailbox, UnknownSiteMailbox};
pub use message::*;
pub use subject::Subject;
