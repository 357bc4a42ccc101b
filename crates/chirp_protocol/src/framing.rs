#![forbid(unsafe_code)]

//! Length-prefixed framing: `[u32 big-endian length][payload]`.
//!
//! The framer itself puts no ceiling on the declared length; transports are
//! responsible for dropping oversized input before it reaches this buffer.

use bytes::BytesMut;
use prost::Message;
use thiserror::Error;

/// Size of the length prefix.
pub const LEN_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),
}

/// Incremental frame extractor over a growable byte buffer.
///
/// `append` is append-only; `pop_frame` removes exactly one complete frame
/// from the head or returns `None` leaving the buffer untouched.
#[derive(Debug, Default)]
pub struct FrameBuffer {
	buf: BytesMut,
}

impl FrameBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn append(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	/// Next complete payload, or `None` if the buffer holds a partial frame.
	pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
		if self.buf.len() < LEN_PREFIX_BYTES {
			return None;
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		if self.buf.len() < LEN_PREFIX_BYTES + len {
			return None;
		}

		let frame = self.buf.split_to(LEN_PREFIX_BYTES + len);
		Some(frame[LEN_PREFIX_BYTES..].to_vec())
	}

	/// Bytes currently buffered (complete or not).
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	pub fn clear(&mut self) {
		self.buf.clear();
	}
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M) -> Vec<u8> {
	let body = msg.encode_to_vec();
	let mut out = Vec::with_capacity(LEN_PREFIX_BYTES + body.len());
	out.extend_from_slice(&(body.len() as u32).to_be_bytes());
	out.extend_from_slice(&body);
	out
}

/// Build a [`crate::pb::Packet`] envelope and encode it as a frame.
pub fn encode_packet(msg_id: crate::pb::MsgId, sequence: i64, body: Vec<u8>) -> Vec<u8> {
	let pkt = crate::pb::Packet {
		msg_id: msg_id as i32,
		sequence,
		body,
	};
	encode_frame(&pkt)
}

/// Decode a message body out of an envelope's `body` bytes.
pub fn decode_body<M: Message + Default>(body: &[u8]) -> Result<M, FramingError> {
	Ok(M::decode(body)?)
}
