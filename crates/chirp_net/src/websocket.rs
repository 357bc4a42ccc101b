#![forbid(unsafe_code)]

//! RFC 6455 server side: handshake, frame codec, acceptor, session task.
//!
//! Only final frames are supported; a fragmented frame closes the
//! connection. Binary payloads carry the same length-prefixed envelopes as
//! the raw-TCP transport.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use bytes::BytesMut;
use chirp_protocol::FrameBuffer;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::{SessionHandle, SessionHandler, TransportKind, WriteCmd, drain_queued_writes};

pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;

/// Frames above this are dropped and the parse buffer cleared.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`.
pub fn compute_accept_key(sec_websocket_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(sec_websocket_key.as_bytes());
	hasher.update(WEBSOCKET_GUID.as_bytes());
	BASE64_STANDARD.encode(hasher.finalize())
}

/// Case-insensitive header lookup over raw request text.
pub fn header_value(request: &str, name: &str) -> Option<String> {
	for line in request.split("\r\n").skip(1) {
		if let Some((k, v)) = line.split_once(':')
			&& k.trim().eq_ignore_ascii_case(name)
		{
			return Some(v.trim().to_string());
		}
	}
	None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
	pub fin: bool,
	pub opcode: u8,
	pub payload: Vec<u8>,
}

/// Incremental WebSocket frame parser (server side: accepts masked input).
#[derive(Debug, Default)]
pub struct WsFrameParser {
	buf: BytesMut,
}

impl WsFrameParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn append(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	pub fn pop_frame(&mut self) -> Option<WsFrame> {
		if self.buf.len() < 2 {
			return None;
		}

		let b0 = self.buf[0];
		let b1 = self.buf[1];
		let fin = b0 & 0x80 != 0;
		let opcode = b0 & 0x0F;
		let masked = b1 & 0x80 != 0;

		let mut payload_len = (b1 & 0x7F) as u64;
		let mut off = 2usize;
		if payload_len == 126 {
			if self.buf.len() < off + 2 {
				return None;
			}
			payload_len = u16::from_be_bytes([self.buf[off], self.buf[off + 1]]) as u64;
			off += 2;
		} else if payload_len == 127 {
			if self.buf.len() < off + 8 {
				return None;
			}
			let mut raw = [0u8; 8];
			raw.copy_from_slice(&self.buf[off..off + 8]);
			payload_len = u64::from_be_bytes(raw);
			off += 8;
		}

		if payload_len > MAX_FRAME_PAYLOAD as u64 {
			warn!(payload_len, "oversized websocket frame dropped");
			self.buf.clear();
			return None;
		}
		let payload_len = payload_len as usize;

		let mut mask_key = [0u8; 4];
		if masked {
			if self.buf.len() < off + 4 {
				return None;
			}
			mask_key.copy_from_slice(&self.buf[off..off + 4]);
			off += 4;
		}

		if self.buf.len() < off + payload_len {
			return None;
		}

		let mut payload = self.buf[off..off + payload_len].to_vec();
		if masked {
			for (i, b) in payload.iter_mut().enumerate() {
				*b ^= mask_key[i % 4];
			}
		}

		let _ = self.buf.split_to(off + payload_len);
		Some(WsFrame { fin, opcode, payload })
	}
}

/// Build a single FIN frame. Clients mask; servers do not.
pub fn build_frame(opcode: u8, payload: &[u8], mask: bool) -> Vec<u8> {
	let len = payload.len();
	let mut out = Vec::with_capacity(len + 14);
	out.push(0x80 | (opcode & 0x0F));

	let mask_bit = if mask { 0x80 } else { 0x00 };
	if len <= 125 {
		out.push(mask_bit | len as u8);
	} else if len <= 65535 {
		out.push(mask_bit | 126);
		out.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		out.push(mask_bit | 127);
		out.extend_from_slice(&(len as u64).to_be_bytes());
	}

	if !mask {
		out.extend_from_slice(payload);
		return out;
	}

	let mut rng = rand::rng();
	let mask_key: [u8; 4] = rng.random();
	out.extend_from_slice(&mask_key);
	out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask_key[i % 4]));
	out
}

/// WebSocket acceptor; each accepted socket becomes a session after the
/// upgrade handshake completes.
pub struct WebSocketServer {
	local_addr: SocketAddr,
	accept_task: JoinHandle<()>,
}

impl WebSocketServer {
	pub async fn bind(addr: SocketAddr, handler: Arc<dyn SessionHandler>) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("bind websocket listener on {addr}"))?;
		let local_addr = listener.local_addr().context("websocket listener local addr")?;

		let accept_task = tokio::spawn(accept_loop(listener, handler));
		Ok(Self { local_addr, accept_task })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn shutdown(&self) {
		self.accept_task.abort();
	}
}

impl Drop for WebSocketServer {
	fn drop(&mut self) {
		self.accept_task.abort();
	}
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn SessionHandler>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				metrics::counter!("chirp_ws_connections_total").increment(1);
				debug!(%peer, "accepted websocket connection");
				let handler = Arc::clone(&handler);
				tokio::spawn(run_session(stream, peer, handler));
			}
			Err(e) => {
				warn!(error = %e, "websocket accept failed");
			}
		}
	}
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn handshake_response(request: &str) -> String {
	let key = header_value(request, "Sec-WebSocket-Key").unwrap_or_default();
	let accept = compute_accept_key(&key);
	format!(
		"HTTP/1.1 101 Switching Protocols\r\n\
		 Upgrade: websocket\r\n\
		 Connection: Upgrade\r\n\
		 Sec-WebSocket-Accept: {accept}\r\n\r\n"
	)
}

async fn run_session(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn SessionHandler>) {
	let (handle, mut cmd_rx) = SessionHandle::new(peer, TransportKind::WebSocket);
	let (mut rd, mut wr) = stream.into_split();

	let mut handshake_buf: Vec<u8> = Vec::new();
	let mut handshake_done = false;
	let mut parser = WsFrameParser::new();
	let mut framer = FrameBuffer::new();
	let mut buf = [0u8; 4096];

	let wrap_binary = |b: Vec<u8>| build_frame(OPCODE_BINARY, &b, false);

	'session: loop {
		tokio::select! {
			res = rd.read(&mut buf) => match res {
				Ok(0) | Err(_) => break 'session,
				Ok(n) => {
					if !handshake_done {
						handshake_buf.extend_from_slice(&buf[..n]);
						let Some(end) = find_blank_line(&handshake_buf) else { continue };

						let leftover = handshake_buf.split_off(end + 4);
						let request = String::from_utf8_lossy(&handshake_buf).into_owned();
						handshake_buf = Vec::new();
						handshake_done = true;

						if wr.write_all(handshake_response(&request).as_bytes()).await.is_err() {
							break 'session;
						}
						parser.append(&leftover);
					} else {
						parser.append(&buf[..n]);
					}

					while let Some(frame) = parser.pop_frame() {
						if !frame.fin {
							warn!(%peer, "fragmented websocket frame; closing");
							break 'session;
						}
						match frame.opcode {
							OPCODE_BINARY => {
								framer.append(&frame.payload);
								while let Some(payload) = framer.pop_frame() {
									metrics::counter!("chirp_ws_frames_in_total").increment(1);
									handler.on_frame(handle.clone(), payload).await;
								}
							}
							OPCODE_PING => {
								if wr.write_all(&build_frame(OPCODE_PONG, &frame.payload, false)).await.is_err() {
									break 'session;
								}
							}
							OPCODE_CLOSE => {
								drain_queued_writes(&mut cmd_rx, &mut wr, wrap_binary).await;
								let _ = wr.write_all(&build_frame(OPCODE_CLOSE, &[], false)).await;
								break 'session;
							}
							_ => {}
						}
					}
				}
			},
			cmd = cmd_rx.recv() => match cmd {
				None | Some(WriteCmd::Close) => break 'session,
				Some(WriteCmd::Send(bytes)) => {
					if wr.write_all(&wrap_binary(bytes)).await.is_err() {
						break 'session;
					}
				}
				Some(WriteCmd::SendAndClose(bytes)) => {
					let _ = wr.write_all(&wrap_binary(bytes)).await;
					drain_queued_writes(&mut cmd_rx, &mut wr, wrap_binary).await;
					break 'session;
				}
			},
		}
	}

	handle.mark_closed();
	let _ = wr.shutdown().await;
	debug!(%peer, session = handle.id(), "websocket session closed");
	handler.on_close(handle).await;
}
