//! Error types for the Common Interface codecs.

use thiserror::Error;

/// Codec-level errors raised while encoding or decoding CI frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input ended before the announced structure was complete.
    #[error("Incomplete data: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    /// Length field uses the indefinite form or more bytes than supported.
    #[error("Invalid length field: 0x{0:02X}")]
    InvalidLengthField(u8),

    /// Length does not fit the encoding it has to be written into.
    #[error("Length too large: {0} bytes (max: {1})")]
    LengthTooLarge(usize, usize),

    /// Tag is unknown for the layer that decoded it.
    #[error("Unknown tag: 0x{0:06X}")]
    UnknownTag(u32),

    /// A body had the wrong size for its tag.
    #[error("Invalid body length for tag 0x{tag:06X}: {len}")]
    InvalidBodyLength { tag: u32, len: usize },

    /// Transport connection id in the frame does not match the expected one.
    #[error("Connection id mismatch: expected {expected}, got {actual}")]
    ConnectionMismatch { expected: u8, actual: u8 },

    /// Text could not be decoded.
    #[error("Failed to decode message: {0}")]
    DecodeError(String),
}

/// Errors from building or parsing a CA_PMT payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaPmtError {
    /// The destination buffer cannot hold the next write.
    #[error("CA_PMT buffer too small: need {needed} bytes at offset {offset}, capacity {capacity}")]
    BufferTooSmall {
        offset: usize,
        needed: usize,
        capacity: usize,
    },

    /// A descriptor length runs past the end of its loop.
    #[error("Malformed descriptor at offset {offset}: length {length} exceeds {available} available bytes")]
    MalformedDescriptor {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// A CA descriptor is shorter than the four mandatory bytes.
    #[error("CA descriptor too short: {0} bytes")]
    ShortCaDescriptor(usize),

    /// A descriptor block exceeds the 12-bit length field.
    #[error("Descriptor block too long: {0} bytes")]
    BlockTooLong(usize),

    /// A field holds a value outside its enumeration.
    #[error("Invalid {0}: 0x{1:02X}")]
    InvalidValue(&'static str, u8),

    /// Parsed payload is truncated.
    #[error("Truncated CA_PMT: {0}")]
    Truncated(&'static str),
}
