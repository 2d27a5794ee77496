//! Wire framing
//!
//! ```text
//! [length:4][sourceHSId:8][destCount:4][destHSId:8 * destCount][message bytes]
//! ```
//!
//! The length excludes itself. Two negative `destCount` values carry
//! out-of-band control instead of destinations:
//!
//! * `-1` poison pill: `[reasonLen:4][reason][cause:4]`
//! * `-2` stop-node notice: `[targetHostId:4]`
//!
//! A [`FrameCipher`] transforms everything after the length prefix.

use std::fmt;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hostmesh_core::types::{HostId, HsId};
use hostmesh_crypto::{FrameCipher, PlaintextCipher};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{buf, Message};
use crate::{WireError, WireResult};

pub const DEST_COUNT_POISON_PILL: i32 = -1;
pub const DEST_COUNT_STOPNODE: i32 = -2;

const LENGTH_PREFIX_LEN: usize = 4;
const HEADER_LEN: usize = 8 + 4;

/// What a host receiving a poison pill must do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PoisonCause {
    /// Every host receiving the pill terminates
    CrashAll = 0,
    /// The receiving host terminates
    CrashMe = 1,
    /// The targeted host terminates
    CrashSpecified = 2,
    /// Log diagnostics and keep running
    PrintStacktrace = 3,
}

impl PoisonCause {
    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_i32(id: i32) -> WireResult<Self> {
        match id {
            0 => Ok(Self::CrashAll),
            1 => Ok(Self::CrashMe),
            2 => Ok(Self::CrashSpecified),
            3 => Ok(Self::PrintStacktrace),
            other => Err(WireError::InvalidPoisonCause(other)),
        }
    }

    /// Whether the receiver terminates
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PrintStacktrace)
    }
}

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message {
        source: HsId,
        destinations: Vec<HsId>,
        /// Encoded message bytes, decoded later through the message factory
        payload: Bytes,
    },
    PoisonPill {
        source: HsId,
        reason: String,
        cause: PoisonCause,
    },
    StopNodeNotice {
        source: HsId,
        target_host: HostId,
    },
}

impl Frame {
    /// Frame carrying `message` to `destinations`
    pub fn message(source: HsId, destinations: Vec<HsId>, message: &Message) -> WireResult<Self> {
        Ok(Frame::Message {
            source,
            destinations,
            payload: message.to_bytes()?,
        })
    }

    pub fn source(&self) -> HsId {
        match self {
            Frame::Message { source, .. }
            | Frame::PoisonPill { source, .. }
            | Frame::StopNodeNotice { source, .. } => *source,
        }
    }

    /// Bytes after the length prefix, before the cipher is applied
    pub fn body_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Frame::Message {
                    destinations,
                    payload,
                    ..
                } => destinations.len() * 8 + payload.len(),
                Frame::PoisonPill { reason, .. } => 4 + reason.len() + 4,
                Frame::StopNodeNotice { .. } => 4,
            }
    }

    fn encode_body(&self, dst: &mut BytesMut) {
        dst.put_i64(self.source());
        match self {
            Frame::Message {
                destinations,
                payload,
                ..
            } => {
                dst.put_i32(destinations.len() as i32);
                for dest in destinations {
                    dst.put_i64(*dest);
                }
                dst.put_slice(payload);
            }
            Frame::PoisonPill { reason, cause, .. } => {
                dst.put_i32(DEST_COUNT_POISON_PILL);
                buf::put_string(dst, reason);
                dst.put_i32(cause.id());
            }
            Frame::StopNodeNotice { target_host, .. } => {
                dst.put_i32(DEST_COUNT_STOPNODE);
                dst.put_i32(*target_host);
            }
        }
    }

    fn decode_body(mut body: Bytes) -> WireResult<Self> {
        let source = buf::get_i64(&mut body)?;
        let dest_count = buf::get_i32(&mut body)?;

        let frame = match dest_count {
            DEST_COUNT_POISON_PILL => {
                let reason = buf::get_string(&mut body, "poison pill reason")?;
                let cause = PoisonCause::from_i32(buf::get_i32(&mut body)?)?;
                Frame::PoisonPill {
                    source,
                    reason,
                    cause,
                }
            }
            DEST_COUNT_STOPNODE => {
                let target_host = buf::get_i32(&mut body)?;
                Frame::StopNodeNotice {
                    source,
                    target_host,
                }
            }
            count if count >= 0 => {
                let count = count as usize;
                if body.remaining() < count * 8 {
                    return Err(WireError::Truncated {
                        needed: count * 8,
                        remaining: body.remaining(),
                    });
                }
                let destinations = (0..count).map(|_| body.get_i64()).collect();
                return Ok(Frame::Message {
                    source,
                    destinations,
                    payload: body,
                });
            }
            other => return Err(WireError::InvalidDestinationCount(other)),
        };

        if body.has_remaining() {
            return Err(WireError::TrailingBytes {
                tag: 0,
                remaining: body.remaining(),
            });
        }
        Ok(frame)
    }
}

/// Length-prefixed frame codec for mesh sub-connections
#[derive(Clone)]
pub struct FrameCodec {
    cipher: Arc<dyn FrameCipher>,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(cipher: Arc<dyn FrameCipher>) -> Self {
        Self {
            cipher,
            max_frame_size: hostmesh_core::MAX_FRAME_SIZE,
        }
    }

    pub fn plaintext() -> Self {
        Self::new(Arc::new(PlaintextCipher))
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    fn check_size(&self, size: usize) -> WireResult<()> {
        if size > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("cipher", &self.cipher.name())
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 0 {
            return Err(WireError::InvalidLength(len as i64));
        }
        let len = len as usize;
        self.check_size(len)?;

        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let body = src.split_to(len).freeze();
        let body = if self.cipher.is_identity() {
            body
        } else {
            Bytes::from(self.cipher.open(&body)?)
        };

        Frame::decode_body(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let body_len = frame.body_len();

        if self.cipher.is_identity() {
            self.check_size(body_len)?;
            dst.reserve(LENGTH_PREFIX_LEN + body_len);
            dst.put_i32(body_len as i32);
            frame.encode_body(dst);
            return Ok(());
        }

        let mut plain = BytesMut::with_capacity(body_len);
        frame.encode_body(&mut plain);
        let sealed = self.cipher.seal(&plain)?;
        self.check_size(sealed.len())?;

        dst.reserve(LENGTH_PREFIX_LEN + sealed.len());
        dst.put_i32(sealed.len() as i32);
        dst.put_slice(&sealed);
        Ok(())
    }
}
