//! Binary packet framing for the sockmux protocol.
//!
//! Every packet carries a fixed 20-byte big-endian preamble followed by a
//! header block and a body block:
//! - 4-byte operator code (hash of the operator name, 0 = ping)
//! - 8-byte signed sequence
//! - 4-byte header length
//! - 4-byte body length
//!
//! The header block is a flat `key=value;` table, see [`HeaderTable`].

pub mod codec;
pub mod error;
pub mod header;
pub mod operator;

#[cfg(feature = "async")]
pub mod async_codec;

pub use codec::{
    decode_frame, decode_packet, encode_packet, FrameConfig, Packet, DEFAULT_MAX_FRAME,
    EMPTY_BODY, PING_OPERATOR, PREAMBLE_SIZE,
};
pub use error::{FrameError, Result};
pub use header::{form_decode, HeaderTable, CODE_KEY, MESSAGE_KEY};
pub use operator::{operator_code, Crc32Hasher, OperatorHasher};

#[cfg(feature = "async")]
pub use async_codec::PacketCodec;
