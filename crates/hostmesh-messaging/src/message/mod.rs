//! Typed wire messages

pub mod buf;
mod binary;
mod failure;
mod heartbeat;
mod unknown;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use hostmesh_core::types::HsId;

pub use binary::BinaryPayload;
pub use failure::{FailureSiteForward, FailureSiteUpdate, FaultMessage};
pub use heartbeat::{Heartbeat, HeartbeatResponse};
pub use unknown::UnknownSite;

use crate::{Subject, WireError, WireResult};

pub const HEARTBEAT_ID: u8 = 1;
pub const HEARTBEAT_RESPONSE_ID: u8 = 2;
pub const FAILURE_SITE_UPDATE_ID: u8 = 3;
pub const FAILURE_SITE_FORWARD_ID: u8 = 4;
pub const UNKNOWN_SITE_ID: u8 = 5;
pub const BINARY_PAYLOAD_ID: u8 = 6;

/// Tags up to and including this value belong to core message types.
/// Application types register decoders above it.
pub const CORE_MESSAGE_ID_MAX: u8 = 64;

/// Source of a message that has not been sent yet
pub const NO_SOURCE: HsId = -1;

/// Size of the `[type tag][subject]` message header
pub const MESSAGE_HEADER_LEN: usize = 2;

/// Body encoding of a built-in message type
pub trait WireBody: Sized {
    const TYPE_TAG: u8;

    /// Exact number of body bytes `encode_body` writes
    fn body_len(&self) -> usize;

    fn encode_body(&self, buf: &mut BytesMut);

    fn decode_body(buf: &mut Bytes) -> WireResult<Self>;
}

/// Message type supplied by an application
pub trait CustomMessage: Send + Sync + fmt::Debug {
    /// Tag above [`CORE_MESSAGE_ID_MAX`]
    fn type_tag(&self) -> u8;

    fn body_len(&self) -> usize;

    fn encode_body(&self, buf: &mut BytesMut);

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub enum Payload {
    Heartbeat(Heartbeat),
    HeartbeatResponse(HeartbeatResponse),
    FailureSiteUpdate(FailureSiteUpdate),
    FailureSiteForward(FailureSiteForward),
    UnknownSite(UnknownSite),
    Binary(BinaryPayload),
    /// Locally derived failure notification, never sent over the wire
    Fault(FaultMessage),
    Custom(Arc<dyn CustomMessage>),
}

impl Payload {
    /// Wire tag, `None` for local-only payloads
    pub fn type_tag(&self) -> Option<u8> {
        match self {
            Payload::Heartbeat(_) => Some(Heartbeat::TYPE_TAG),
            Payload::HeartbeatResponse(_) => Some(HeartbeatResponse::TYPE_TAG),
            Payload::FailureSiteUpdate(_) => Some(FailureSiteUpdate::TYPE_TAG),
            Payload::FailureSiteForward(_) => Some(FailureSiteForward::TYPE_TAG),
            Payload::UnknownSite(_) => Some(UnknownSite::TYPE_TAG),
            Payload::Binary(_) => Some(BinaryPayload::TYPE_TAG),
            Payload::Fault(_) => None,
            Payload::Custom(custom) => Some(custom.type_tag()),
        }
    }

    /// Subject a message carrying this payload gets unless overridden
    pub fn default_subject(&self) -> Subject {
        match self {
            Payload::FailureSiteUpdate(_) => Subject::FailureSiteUpdate,
            Payload::FailureSiteForward(_) => Subject::SiteFailureForward,
            Payload::Fault(_) => Subject::Failure,
            _ => Subject::Default,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Heartbeat(_) => "Heartbeat",
            Payload::HeartbeatResponse(_) => "HeartbeatResponse",
            Payload::FailureSiteUpdate(_) => "FailureSiteUpdate",
            Payload::FailureSiteForward(_) => "FailureSiteForward",
            Payload::UnknownSite(_) => "UnknownSite",
            Payload::Binary(_) => "BinaryPayload",
            Payload::Fault(_) => "Fault",
            Payload::Custom(_) => "Custom",
        }
    }

    fn body_len(&self) -> WireResult<usize> {
        Ok(match self {
            Payload::Heartbeat(m) => m.body_len(),
            Payload::HeartbeatResponse(m) => m.body_len(),
            Payload::FailureSiteUpdate(m) => m.body_len(),
            Payload::FailureSiteForward(m) => m.body_len(),
            Payload::UnknownSite(m) => m.body_len(),
            Payload::Binary(m) => m.body_len(),
            Payload::Fault(_) => return Err(WireError::NotWireEncodable("Fault")),
            Payload::Custom(m) => m.body_len(),
        })
    }

    fn encode_body(&self, buf: &mut BytesMut) -> WireResult<()> {
        match self {
            Payload::Heartbeat(m) => m.encode_body(buf),
            Payload::HeartbeatResponse(m) => m.encode_body(buf),
            Payload::FailureSiteUpdate(m) => m.encode_body(buf),
            Payload::FailureSiteForward(m) => m.encode_body(buf),
            Payload::UnknownSite(m) => m.encode_body(buf),
            Payload::Binary(m) => m.encode_body(buf),
            Payload::Fault(_) => return Err(WireError::NotWireEncodable("Fault")),
            Payload::Custom(m) => m.encode_body(buf),
        }
        Ok(())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Heartbeat(a), Payload::Heartbeat(b)) => a == b,
            (Payload::HeartbeatResponse(a), Payload::HeartbeatResponse(b)) => a == b,
            (Payload::FailureSiteUpdate(a), Payload::FailureSiteUpdate(b)) => a == b,
            (Payload::FailureSiteForward(a), Payload::FailureSiteForward(b)) => a == b,
            (Payload::UnknownSite(a), Payload::UnknownSite(b)) => a == b,
            (Payload::Binary(a), Payload::Binary(b)) => a == b,
            (Payload::Fault(a), Payload::Fault(b)) => a == b,
            // Custom payloads are opaque, compare identity
            (Payload::Custom(a), Payload::Custom(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

macro_rules! impl_from_payload {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

impl_from_payload! {
    Heartbeat => Heartbeat,
    HeartbeatResponse => HeartbeatResponse,
    FailureSiteUpdate => FailureSiteUpdate,
    FailureSiteForward => FailureSiteForward,
    UnknownSite => UnknownSite,
    BinaryPayload => Binary,
    FaultMessage => Fault,
}

impl From<Arc<dyn CustomMessage>> for Payload {
    fn from(value: Arc<dyn CustomMessage>) -> Self {
        Payload::Custom(value)
    }
}

/// A typed payload plus the routing metadata every message carries
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    source: HsId,
    subject: Subject,
    payload: Payload,
}

impl Message {
    pub fn new(payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            source: NO_SOURCE,
            subject: payload.default_subject(),
            payload,
        }
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = subject;
        self
    }

    /// Rebuild a message decoded from the wire
    pub(crate) fn from_parts(source: HsId, subject: Subject, payload: Payload) -> Self {
        Self {
            source,
            subject,
            payload,
        }
    }

    pub fn source(&self) -> HsId {
        self.source
    }

    /// Stamped by the sending mailbox; application code never sets it
    pub fn set_source(&mut self, source: HsId) {
        self.source = source;
    }

    pub fn subject(&self) -> Subject {
        self.subject
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn type_tag(&self) -> Option<u8> {
        self.payload.type_tag()
    }

    /// Exact encoded length including the two header bytes
    pub fn serialized_size(&self) -> WireResult<usize> {
        Ok(MESSAGE_HEADER_LEN + self.payload.body_len()?)
    }

    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        let tag = self
            .type_tag()
            .ok_or(WireError::NotWireEncodable(self.payload.kind()))?;
        buf.put_u8(tag);
        buf.put_u8(self.subject.id());
        self.payload.encode_body(buf)
    }

    pub fn to_bytes(&self) -> WireResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.serialized_size()?);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subjects() {
        assert_eq!(
            Message::new(Heartbeat::new(1, 0)).subject(),
            Subject::Default
        );
        assert_eq!(
            Message::new(FailureSiteUpdate::default()).subject(),
            Subject::FailureSiteUpdate
        );
        assert_eq!(
            Message::new(FailureSiteForward::new(3, FailureSiteUpdate::default())).subject(),
            Subject::SiteFailureForward
        );
        assert_eq!(
            Message::new(FaultMessage::witnessed(1, 2)).subject(),
            Subject::Failure
        );
    }

    #[test]
    fn test_serialized_size_matches_encoding() {
        let msg = Message::new(Heartbeat::new(42, 41));
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), msg.serialized_size().unwrap());
        assert_eq!(bytes[0], HEARTBEAT_ID);
        assert_eq!(bytes[1], Subject::Default.id());
    }

    #[test]
    fn test_fault_is_local_only() {
        let msg = Message::new(FaultMessage::witnessed(1, 2));
        assert_eq!(msg.type_tag(), None);
        assert!(matches!(
            msg.to_bytes(),
            Err(WireError::NotWireEncodable("Fault"))
        ));
    }

    #[test]
    fn test_source_is_unset_until_sent() {
        let mut msg = Message::new(Heartbeat::new(0, 0));
        assert_eq!(msg.source(), NO_SOURCE);
        msg.set_source(7);
        assert_eq!(msg.source(), 7);
    }
}
