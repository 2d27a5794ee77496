use bytes::{BufMut, Bytes, BytesMut};

use super::{buf, WireBody, UNKNOWN_SITE_ID};
use crate::WireResult;

/// Bounce sent back when a message reaches an HSId with no real mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownSite {
    pub original_type: u8,
    pub original_subject: u8,
}

impl WireBody for UnknownSite {
    const TYPE_TAG: u8 = UNKNOWN_SITE_ID;

    fn body_len(&self) -> usize {
        2
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(self.original_type);
        buf.put_u8(self.original_subject);
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let original_type = buf::get_u8(buf)?;
        let original_subject = buf::get_u8(buf)?;
        Ok(Self {
            original_type,
            original_subject,
        })
    }
}
