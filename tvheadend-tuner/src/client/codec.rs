//! Stream framing for HTSP over TCP.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use htsp_protocol::{decode_frame, encode_message, Message};

use crate::error::HtspError;

/// `tokio_util` codec wrapping the HTSP frame encoder and decoder.
///
/// Besides whole messages it accepts frames that were already encoded with
/// [`encode_message`]; those are written as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtspCodec;

impl Decoder for HtspCodec {
    type Item = Message;
    type Error = HtspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, HtspError> {
        Ok(decode_frame(src)?)
    }
}

impl Encoder<Message> for HtspCodec {
    type Error = HtspError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), HtspError> {
        let frame = encode_message(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

impl Encoder<Bytes> for HtspCodec {
    type Error = HtspError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), HtspError> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
