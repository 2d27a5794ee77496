use bytes::{BufMut, Bytes, BytesMut};

use super::{buf, WireBody, HEARTBEAT_ID, HEARTBEAT_RESPONSE_ID};
use crate::WireResult;

/// Periodic liveness message sent to the heartbeat endpoint of every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub txn_id: i64,
    pub last_safe_txn_id: i64,
}

impl Heartbeat {
    pub fn new(txn_id: i64, last_safe_txn_id: i64) -> Self {
        Self {
            txn_id,
            last_safe_txn_id,
        }
    }
}

impl WireBody for Heartbeat {
    const TYPE_TAG: u8 = HEARTBEAT_ID;

    fn body_len(&self) -> usize {
        16
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64(self.txn_id);
        buf.put_i64(self.last_safe_txn_id);
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let txn_id = buf::get_i64(buf)?;
        let last_safe_txn_id = buf::get_i64(buf)?;
        Ok(Self {
            txn_id,
            last_safe_txn_id,
        })
    }
}

/// Answer to a [`Heartbeat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub last_received_txn_id: i64,
    pub blocked: bool,
}

impl HeartbeatResponse {
    pub fn new(last_received_txn_id: i64, blocked: bool) -> Self {
        Self {
            last_received_txn_id,
            blocked,
        }
    }
}

impl WireBody for HeartbeatResponse {
    const TYPE_TAG: u8 = HEARTBEAT_RESPONSE_ID;

    fn body_len(&self) -> usize {
        9
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64(self.last_received_txn_id);
        buf::put_bool(buf, self.blocked);
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let last_received_txn_id = buf::get_i64(buf)?;
        let blocked = buf::get_bool(buf)?;
        Ok(Self {
            last_received_txn_id,
            blocked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn test_heartbeat_layout() {
        let mut out = BytesMut::new();
        Heartbeat::new(1, 2).encode_body(&mut out);
        assert_eq!(
            &out[..],
            &[0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2]
        );

        let mut bytes = out.freeze();
        let decoded = Heartbeat::decode_body(&mut bytes).unwrap();
        assert_eq!(decoded, Heartbeat::new(1, 2));
        assert!(!bytes.has_remaining());
    }

    #[test]
    fn test_response_blocked_flag() {
        let mut out = BytesMut::new();
        HeartbeatResponse::new(-1, true).encode_body(&mut out);
        assert_eq!(out.len(), 9);
        assert_eq!(out[8], 1);
    }
}
