//! HTSP message model and binary codec.
//!
//! HTSP is the binary RPC protocol spoken by the Tvheadend backend. Every
//! message is a self-describing set of named fields; requests carry a
//! `method` and a `seq`, replies echo the `seq`, and the backend pushes
//! unsolicited messages (`channelAdd`, `tagUpdate`, ...) identified only by
//! their `method`.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+---------------------------+
//! | Length u32 BE  |  Fields (type/name/data)  |
//! +----------------+---------------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use htsp_protocol::{decode_frame, encode_message, Message};
//! use bytes::BytesMut;
//!
//! let msg = Message::request("getTicket").with("channelId", 5u32);
//! let encoded = encode_message(&msg).unwrap();
//!
//! let mut buf = BytesMut::from(&encoded[..]);
//! let decoded = decode_frame(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{decode_body, decode_frame, encode_message, FIELD_HEADER_SIZE, MAX_NESTING_DEPTH};
pub use error::ProtocolError;
pub use types::{
    FieldType, Message, Value, FIELD_ERROR, FIELD_METHOD, FIELD_SEQ, HTSP_VERSION,
    LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};
