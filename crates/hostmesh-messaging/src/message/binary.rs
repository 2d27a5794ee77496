use bytes::{Bytes, BytesMut};

use super::{buf, WireBody, BINARY_PAYLOAD_ID};
use crate::{WireError, WireResult};

/// Opaque application bytes with a short metadata header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPayload {
    metadata: Bytes,
    payload: Bytes,
}

impl BinaryPayload {
    pub fn new(metadata: impl Into<Bytes>, payload: impl Into<Bytes>) -> WireResult<Self> {
        let metadata = metadata.into();
        if metadata.len() > u16::MAX as usize {
            return Err(WireError::FieldTooLong {
                field: "metadata",
                len: metadata.len(),
                max: u16::MAX as usize,
            });
        }
        let payload = payload.into();
        if payload.len() > i32::MAX as usize {
            return Err(WireError::FieldTooLong {
                field: "payload",
                len: payload.len(),
                max: i32::MAX as usize,
            });
        }
        Ok(Self { metadata, payload })
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl WireBody for BinaryPayload {
    const TYPE_TAG: u8 = BINARY_PAYLOAD_ID;

    fn body_len(&self) -> usize {
        2 + self.metadata.len() + 4 + self.payload.len()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf::put_bytes_u16(buf, &self.metadata);
        buf::put_bytes_u32(buf, &self.payload);
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let metadata = buf::get_bytes_u16(buf)?;
        let payload = buf::get_bytes_u32(buf)?;
        Ok(Self { metadata, payload })
    }
}
