// Length-prefixed framing for flattened messages on a byte stream.
use bytes::{BufMut, Bytes, BytesMut};

use crate::message::Message;
use crate::{Error, Result};

/// Second header word of every frame; identifies message framing so a
/// decoder can fault on foreign streams instead of honoring a bogus length.
pub const FRAME_ENCODING_MAGIC: u32 = 1164862256;

/// The fixed eight-byte frame header: body size then encoding magic, both
/// little-endian.
///
/// ```
/// use muscle_wire::FrameHeader;
///
/// let header = FrameHeader { body_len: 5 };
/// let mut bytes = [0u8; FrameHeader::LEN];
/// header.encode_into(&mut bytes);
/// let decoded = FrameHeader::decode(&bytes).expect("decode");
/// assert_eq!(decoded.body_len, 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u32,
}

impl FrameHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.body_len);
        buf.put_u32_le(FRAME_ENCODING_MAGIC);
    }

    pub fn encode_into(&self, out: &mut [u8; Self::LEN]) {
        out[..4].copy_from_slice(&self.body_len.to_le_bytes());
        out[4..].copy_from_slice(&FRAME_ENCODING_MAGIC.to_le_bytes());
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let body_len = u32::from_le_bytes(input[..4].try_into().expect("four bytes"));
        let magic = u32::from_le_bytes(input[4..8].try_into().expect("four bytes"));
        if magic != FRAME_ENCODING_MAGIC {
            return Err(Error::InvalidMagic);
        }
        Ok(Self { body_len })
    }

    /// Validates the declared body size against the receiver's cap before
    /// any allocation happens on its behalf.
    pub fn check_body_len(&self, max_body: usize) -> Result<usize> {
        let len = self.body_len as usize;
        if len > max_body {
            return Err(Error::FrameTooLarge(len));
        }
        Ok(len)
    }
}

/// Flattens a message and prefixes the frame header in one buffer.
pub fn encode_frame(msg: &Message) -> Bytes {
    let body_len = msg.flattened_size();
    let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body_len);
    FrameHeader {
        body_len: body_len as u32,
    }
    .encode(&mut buf);
    msg.flatten_into(&mut buf);
    buf.freeze()
}
