#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{FrameBuffer, FramingError, decode_body, encode_frame, encode_packet};
