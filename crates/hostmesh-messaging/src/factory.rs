//! Registry mapping message type tags to decoders

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use hostmesh_core::types::HsId;

use crate::message::{
    buf, BinaryPayload, FailureSiteForward, FailureSiteUpdate, Heartbeat, HeartbeatResponse,
    Message, Payload, UnknownSite, WireBody, CORE_MESSAGE_ID_MAX,
};
use crate::{Subject, WireError, WireResult};

/// Decodes a message body positioned after the two header bytes
pub type DecodeFn = Arc<dyn Fn(&mut Bytes) -> WireResult<Payload> + Send + Sync>;

fn core_decoder<T>() -> DecodeFn
where
    T: WireBody + Into<Payload> + 'static,
{
    Arc::new(|buf: &mut Bytes| -> WireResult<Payload> {
        T::decode_body(buf).map(Into::into)
    })
}

/// Tag to decoder registry shared by every connection of a host
#[derive(Clone)]
pub struct MessageFactory {
    decoders: HashMap<u8, DecodeFn>,
}

impl MessageFactory {
    /// Factory with every core message type registered
    pub fn new() -> Self {
        let mut decoders = HashMap::new();
        decoders.insert(Heartbeat::TYPE_TAG, core_decoder::<Heartbeat>());
        decoders.insert(
            HeartbeatResponse::TYPE_TAG,
            core_decoder::<HeartbeatResponse>(),
        );
        decoders.insert(
            FailureSiteUpdate::TYPE_TAG,
            core_decoder::<FailureSiteUpdate>(),
        );
        decoders.insert(
            FailureSiteForward::TYPE_TAG,
            core_decoder::<FailureSiteForward>(),
        );
        decoders.insert(UnknownSite::TYPE_TAG, core_decoder::<UnknownSite>());
        decoders.insert(BinaryPayload::TYPE_TAG, core_decoder::<BinaryPayload>());
        Self { decoders }
    }

    /// Register an application message type
    pub fn register(&mut self, tag: u8, decoder: DecodeFn) -> WireResult<()> {
        if tag <= CORE_MESSAGE_ID_MAX {
            return Err(WireError::ReservedType(tag));
        }
        if self.decoders.contains_key(&tag) {
            return Err(WireError::DuplicateType(tag));
        }
        self.decoders.insert(tag, decoder);
        Ok(())
    }

    pub fn is_registered(&self, tag: u8) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// Decode message bytes received from `source`.
    ///
    /// Fails with [`WireError::UnknownType`] for an unregistered tag and with
    /// [`WireError::TrailingBytes`] when the decoder does not consume the
    /// whole buffer.
    pub fn decode(&self, source: HsId, mut bytes: Bytes) -> WireResult<Message> {
        let tag = buf::get_u8(&mut bytes)?;
        let subject = Subject::from_u8(buf::get_u8(&mut bytes)?)?;

        let decoder = self
            .decoders
            .get(&tag)
            .ok_or(WireError::UnknownType(tag))?;
        let payload = decoder(&mut bytes)?;

        if bytes.has_remaining() {
            return Err(WireError::TrailingBytes {
                tag,
                remaining: bytes.remaining(),
            });
        }

        Ok(Message::from_parts(source, subject, payload))
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<u8> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("MessageFactory").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CustomMessage, FaultMessage, HEARTBEAT_ID};
    use bytes::{BufMut, BytesMut};
    use hostmesh_core::types::{hsid, AGREEMENT_SITE_ID};
    use std::any::Any;
    use std::collections::{BTreeMap, BTreeSet};

    fn round_trip(msg: Message) -> Message {
        let factory = MessageFactory::new();
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), msg.serialized_size().unwrap());
        factory.decode(msg.source(), bytes).unwrap()
    }

    #[test]
    fn test_core_messages_round_trip() {
        let update = FailureSiteUpdate::new(
            BTreeSet::from([hsid(0, AGREEMENT_SITE_ID), hsid(1, AGREEMENT_SITE_ID)]),
            BTreeMap::from([(hsid(2, AGREEMENT_SITE_ID), 99)]),
        );
        let decided = update
            .clone()
            .with_decision(BTreeSet::from([hsid(2, AGREEMENT_SITE_ID)]));

        let messages = vec![
            Message::new(Heartbeat::new(10, 9)),
            Message::new(HeartbeatResponse::new(10, false)),
            Message::new(update.clone()),
            Message::new(decided),
            Message::new(FailureSiteForward::new(hsid(1, AGREEMENT_SITE_ID), update)),
            Message::new(UnknownSite {
                original_type: HEARTBEAT_ID,
                original_subject: 0,
            }),
            Message::new(BinaryPayload::new(&b"meta"[..], &b"payload"[..]).unwrap()),
        ];

        for mut msg in messages {
            msg.set_source(hsid(3, 1));
            let decoded = round_trip(msg.clone());
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_subject_survives_decoding() {
        let msg = Message::new(Heartbeat::new(1, 1)).with_subject(Subject::Failure);
        assert_eq!(round_trip(msg).subject(), Subject::Failure);
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let factory = MessageFactory::new();
        let err = factory
            .decode(0, Bytes::from_static(&[200, 0]))
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownType(200)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let factory = MessageFactory::new();
        let mut bytes = BytesMut::from(&Message::new(Heartbeat::new(1, 2)).to_bytes().unwrap()[..]);
        bytes.put_u8(0xAB);

        let err = factory.decode(0, bytes.freeze()).unwrap_err();
        assert!(matches!(
            err,
            WireError::TrailingBytes {
                tag: HEARTBEAT_ID,
                remaining: 1
            }
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let factory = MessageFactory::new();
        let err = factory
            .decode(0, Bytes::from_static(&[HEARTBEAT_ID, 0, 0, 0]))
            .unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    impl CustomMessage for Ping {
        fn type_tag(&self) -> u8 {
            100
        }

        fn body_len(&self) -> usize {
            4
        }

        fn encode_body(&self, buf: &mut BytesMut) {
            buf.put_u32(self.0);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_custom_registration() {
        let mut factory = MessageFactory::new();
        let decoder: DecodeFn = Arc::new(|buf: &mut Bytes| -> WireResult<Payload> {
            let value = buf::get_i32(buf)? as u32;
            Ok(Payload::Custom(Arc::new(Ping(value))))
        });

        assert!(matches!(
            factory.register(HEARTBEAT_ID, decoder.clone()),
            Err(WireError::ReservedType(HEARTBEAT_ID))
        ));
        factory.register(100, decoder.clone()).unwrap();
        assert!(matches!(
            factory.register(100, decoder),
            Err(WireError::DuplicateType(100))
        ));

        let payload: Arc<dyn CustomMessage> = Arc::new(Ping(7));
        let bytes = Message::new(payload).to_bytes().unwrap();
        let decoded = factory.decode(hsid(1, 0), bytes).unwrap();
        match decoded.payload() {
            Payload::Custom(custom) => {
                assert_eq!(custom.as_any().downcast_ref::<Ping>(), Some(&Ping(7)));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_fault_cannot_be_framed() {
        assert!(Message::new(FaultMessage::witnessed(1, 2)).to_bytes().is_err());
    }
}
