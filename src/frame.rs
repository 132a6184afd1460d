use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::ProtocolError;
use crate::fixed_buffer::FixedBuf;
use crate::safe_converter::PrecheckedCast;

/// The fixed frame header size on the wire.
pub const FRAME_HEADER_LEN: usize = 16;

/// Upper bound for a frame payload - the header's length field is a u16, so
///  this is the largest payload it can express.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    InitReq = 0x01,
    InitRes = 0x02,
    CallReq = 0x03,
    CallRes = 0x04,
    CallReqCont = 0x13,
    CallResCont = 0x14,
    PingReq = 0xd0,
    PingRes = 0xd1,
    Error = 0xff,
}

/// Frame header - 16 bytes, all multi-byte fields big-endian:
///
/// ```ascii
/// 0:  payload size (u16)
/// 2:  frame type (u8)
/// 3:  reserved (u8)
/// 4:  message id (u32) - 0 is reserved for connection-fatal errors
/// 8:  reserved (u64)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: u32,
    pub frame_type: FrameType,
    pub size: u16,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = FRAME_HEADER_LEN;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.size);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(0);
        buf.put_u32(self.id);
        buf.put_u64(0);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, ProtocolError> {
        let size = buf.try_get_u16().map_err(|_| ProtocolError::Truncated)?;
        let raw_type = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| ProtocolError::UnknownFrameType(raw_type))?;
        let _reserved = buf.try_get_u8().map_err(|_| ProtocolError::Truncated)?;
        let id = buf.try_get_u32().map_err(|_| ProtocolError::Truncated)?;
        let _reserved = buf.try_get_u64().map_err(|_| ProtocolError::Truncated)?;

        Ok(FrameHeader { id, frame_type, size })
    }
}

/// A complete frame: header plus pooled payload buffer. The header's size
///  field always matches the payload length.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: FixedBuf,
}

impl Frame {
    pub fn new(id: u32, frame_type: FrameType, payload: FixedBuf) -> Result<Frame, ProtocolError> {
        if payload.len() > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(payload.len()));
        }

        Ok(Frame {
            header: FrameHeader {
                id,
                frame_type,
                size: payload.len().prechecked_cast(),
            },
            payload,
        })
    }
}
