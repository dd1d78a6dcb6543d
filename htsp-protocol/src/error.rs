//! Error types for the HTSP message codec.

use thiserror::Error;

/// Protocol-level errors raised while encoding, decoding or reading messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame length prefix exceeds the accepted maximum.
    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(u32, u32),

    /// A field header or field body runs past the end of its container.
    #[error("Incomplete field: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// Field type byte is not one the codec understands.
    #[error("Invalid field type: {0}")]
    InvalidFieldType(u8),

    /// Field data has the wrong size for its declared type.
    #[error("Invalid length {len} for field type {field_type}")]
    InvalidFieldLength { field_type: u8, len: usize },

    /// Field name or string value is not valid UTF-8.
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Nested maps and lists exceed the supported depth.
    #[error("Nesting too deep: more than {0} levels")]
    NestingTooDeep(usize),

    /// Field name does not fit in the one-byte length slot.
    #[error("Field name too long: {0} bytes")]
    NameTooLong(usize),

    /// A complete frame was read but its body could not be decoded.
    ///
    /// The frame has been consumed from the input, so the stream is still
    /// aligned on the next frame boundary.
    #[error("Malformed frame of {frame_len} bytes: {source}")]
    BadFrame {
        frame_len: usize,
        #[source]
        source: Box<ProtocolError>,
    },

    /// A required field is absent.
    #[error("Missing field: {0}")]
    MissingField(String),

    /// A field is present but holds a different kind of value.
    #[error("Field '{field}' is not {expected}")]
    FieldType {
        field: String,
        expected: &'static str,
    },

    /// A chunked reply kept announcing more chunks past the accepted limit.
    #[error("Reply exceeded {0} chunks")]
    TooManyChunks(usize),
}

impl ProtocolError {
    /// Returns true when the input stream is still positioned on a frame boundary.
    pub fn is_resynchronizable(&self) -> bool {
        matches!(self, ProtocolError::BadFrame { .. })
    }
}
