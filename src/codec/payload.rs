//! Payload codecs.

use crate::error::CodecError;
use bytes::BytesMut;

/// Converts between a frame body and an application message.
pub trait PayloadCodec {
    /// Borrowed form accepted by `encode`.
    type Input: ?Sized;
    /// Owned form produced by `decode`.
    type Output;

    fn encode(&self, msg: &Self::Input, dst: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(&self, src: &[u8]) -> Result<Self::Output, CodecError>;
}

/// Plain UTF-8 text payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl PayloadCodec for TextCodec {
    type Input = str;
    type Output = String;

    fn encode(&self, msg: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(msg.as_bytes());
        Ok(())
    }

    fn decode(&self, src: &[u8]) -> Result<String, CodecError> {
        std::str::from_utf8(src)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }
}
