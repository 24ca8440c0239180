//! Variable-length packet codec.

use super::payload::PayloadCodec;
use crate::error::CodecError;
use bytes::{BufMut, BytesMut};

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// A u32 varint never needs more than 5 bytes.
const MAX_PREFIX_LEN: usize = 5;

/// Decode result.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult {
    /// A whole frame is buffered.
    Complete {
        /// Bytes taken by the length prefix.
        header_len: usize,
        /// Bytes of payload following the prefix.
        payload_len: usize,
    },
    /// Need more data.
    Incomplete,
    /// The buffered bytes can never form a valid frame.
    Invalid(CodecError),
}

/// Length-prefixed framing: unsigned LEB128 length, then the body.
#[derive(Debug, Clone, Copy)]
pub struct VariableLengthCodec {
    max_frame_size: usize,
}

impl Default for VariableLengthCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableLengthCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(u32::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode `msg` with `payload` and append the framed result to `dst`.
    pub fn encode<P: PayloadCodec>(
        &self,
        msg: &P::Input,
        payload: &P,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        payload.encode(msg, &mut body)?;
        self.encode_frame(&body, dst)
    }

    /// Append an already-encoded body to `dst` as one frame.
    ///
    /// `dst` is left untouched on error.
    pub fn encode_frame(&self, body: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(MAX_PREFIX_LEN + body.len());
        put_varint(body.len() as u32, dst);
        dst.extend_from_slice(body);
        Ok(())
    }

    /// Look for one frame at the start of `input`.
    ///
    /// An oversize length is reported as soon as the prefix is readable,
    /// without waiting for the body.
    pub fn decode(&self, input: &[u8]) -> DecodeResult {
        let mut length: u64 = 0;

        for (i, &byte) in input.iter().take(MAX_PREFIX_LEN).enumerate() {
            length |= u64::from(byte & 0x7f) << (7 * i);

            if byte & 0x80 == 0 {
                if length > u64::from(u32::MAX) {
                    return DecodeResult::Invalid(CodecError::MalformedLength);
                }

                let header_len = i + 1;
                let payload_len = length as usize;

                if payload_len > self.max_frame_size {
                    return DecodeResult::Invalid(CodecError::FrameTooLarge {
                        size: payload_len,
                        max: self.max_frame_size,
                    });
                }

                if input.len() < header_len + payload_len {
                    return DecodeResult::Incomplete;
                }

                return DecodeResult::Complete {
                    header_len,
                    payload_len,
                };
            }
        }

        if input.len() >= MAX_PREFIX_LEN {
            DecodeResult::Invalid(CodecError::MalformedLength)
        } else {
            DecodeResult::Incomplete
        }
    }
}

fn put_varint(mut value: u32, dst: &mut BytesMut) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}
