// Self-describing message format for framing typed dictionaries on the network.
pub mod field;
pub mod frame;
pub mod message;
pub mod protocol;

pub use field::{type_code, Field, Point, Rect};
pub use frame::{FrameHeader, FRAME_ENCODING_MAGIC};
pub use message::{rolling_checksum, Message, MESSAGE_PROTOCOL_MAGIC};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("field not found: {0}")]
    NotFound(String),
    #[error("field {name} holds type {actual:#010x}, requested {requested:#010x}")]
    TypeMismatch {
        name: String,
        actual: u32,
        requested: u32,
    },
    #[error("malformed message data: {0}")]
    BadData(&'static str),
    #[error("frame body of {0} bytes exceeds the configured cap")]
    FrameTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid frame magic")]
    InvalidMagic,
}

/// Composes a four-character constant the way the wire protocol spells its
/// type and command codes.
pub const fn fourcc(tag: [u8; 4]) -> u32 {
    u32::from_be_bytes(tag)
}
