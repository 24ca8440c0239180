//! Wire codecs.
//!
//! Every message travels as one length-prefixed packet:
//!
//! ```text
//! <length as unsigned LEB128 varint><payload of exactly length bytes>
//!
//! Example ("hello"):
//! 0x05 'h' 'e' 'l' 'l' 'o'
//! ```
//!
//! The packet codec only delimits frames. The payload codec turns the
//! frame body into an application message (UTF-8 text here).

pub mod packet;
pub mod payload;

pub use packet::{DecodeResult, VariableLengthCodec};
pub use payload::{PayloadCodec, TextCodec};
