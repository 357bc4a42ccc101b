#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chirp_net::websocket::{OPCODE_BINARY, OPCODE_CLOSE, OPCODE_PING, OPCODE_PONG, WsFrameParser, build_frame};
use chirp_net::{SessionHandle, SessionHandler, TcpServer, WebSocketServer};
use chirp_protocol::FrameBuffer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn frame_of(payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + payload.len());
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	out
}

/// Echoes every frame back and reports closes.
struct EchoHandler {
	frames: mpsc::UnboundedSender<Vec<u8>>,
	closes: mpsc::UnboundedSender<u64>,
}

#[async_trait::async_trait]
impl SessionHandler for EchoHandler {
	async fn on_frame(&self, session: SessionHandle, payload: Vec<u8>) {
		let _ = self.frames.send(payload.clone());
		session.send(frame_of(&payload));
	}

	async fn on_close(&self, session: SessionHandle) {
		let _ = self.closes.send(session.id());
	}
}

/// First frame triggers a send followed by send-and-close.
struct FlushThenCloseHandler;

#[async_trait::async_trait]
impl SessionHandler for FlushThenCloseHandler {
	async fn on_frame(&self, session: SessionHandle, _payload: Vec<u8>) {
		session.send(frame_of(b"first"));
		session.send(frame_of(b"second"));
		session.send_and_close(frame_of(b"final"));
	}
}

async fn read_frames(stream: &mut TcpStream, want: usize) -> Vec<Vec<u8>> {
	let mut framer = FrameBuffer::new();
	let mut out = Vec::new();
	let mut buf = [0u8; 4096];
	while out.len() < want {
		let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
			.await
			.expect("read timed out")
			.expect("read failed");
		assert!(n > 0, "peer closed early");
		framer.append(&buf[..n]);
		while let Some(f) = framer.pop_frame() {
			out.push(f);
		}
	}
	out
}

#[tokio::test]
async fn tcp_frames_round_trip_in_order_across_chunkings() {
	let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, _closes_rx) = mpsc::unbounded_channel();
	let server = TcpServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = TcpStream::connect(server.local_addr()).await.expect("connect");

	let payloads: [&[u8]; 3] = [b"alpha", b"", b"gamma-gamma"];
	let mut wire = Vec::new();
	for p in payloads {
		wire.extend_from_slice(&frame_of(p));
	}

	// Deliver in deliberately awkward chunks.
	for chunk in wire.chunks(3) {
		client.write_all(chunk).await.expect("write");
	}

	for expected in payloads {
		let got = timeout(Duration::from_secs(5), frames_rx.recv())
			.await
			.expect("frame timed out")
			.expect("handler alive");
		assert_eq!(got.as_slice(), expected);
	}

	let echoed = read_frames(&mut client, payloads.len()).await;
	for (e, p) in echoed.iter().zip(payloads.iter()) {
		assert_eq!(e.as_slice(), *p);
	}
}

#[tokio::test]
async fn send_and_close_flushes_queue_before_closing() {
	let server = TcpServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(FlushThenCloseHandler))
		.await
		.expect("bind");

	let mut client = TcpStream::connect(server.local_addr()).await.expect("connect");
	client.write_all(&frame_of(b"go")).await.expect("write");

	let frames = read_frames(&mut client, 3).await;
	assert_eq!(frames[0], b"first");
	assert_eq!(frames[1], b"second");
	assert_eq!(frames[2], b"final");

	// After the flush the server closes.
	let mut buf = [0u8; 16];
	let n = timeout(Duration::from_secs(5), client.read(&mut buf))
		.await
		.expect("close timed out")
		.expect("read failed");
	assert_eq!(n, 0);
}

#[tokio::test]
async fn close_callback_fires_exactly_once() {
	let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, mut closes_rx) = mpsc::unbounded_channel();
	let server = TcpServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = TcpStream::connect(server.local_addr()).await.expect("connect");
	client.write_all(&frame_of(b"hello")).await.expect("write");
	let _ = read_frames(&mut client, 1).await;
	drop(client);

	let closed = timeout(Duration::from_secs(5), closes_rx.recv())
		.await
		.expect("close timed out")
		.expect("handler alive");
	assert!(closed > 0);

	// No second close for the same session.
	let extra = timeout(Duration::from_millis(200), closes_rx.recv()).await;
	assert!(extra.is_err(), "close callback fired twice");
}

async fn ws_upgrade(addr: SocketAddr) -> TcpStream {
	let mut client = TcpStream::connect(addr).await.expect("connect");
	let request = "GET /chat HTTP/1.1\r\n\
		Host: localhost\r\n\
		Upgrade: websocket\r\n\
		Connection: Upgrade\r\n\
		Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
		Sec-WebSocket-Version: 13\r\n\r\n";
	client.write_all(request.as_bytes()).await.expect("write upgrade");

	let mut response = Vec::new();
	let mut buf = [0u8; 1024];
	while !response.windows(4).any(|w| w == b"\r\n\r\n") {
		let n = timeout(Duration::from_secs(5), client.read(&mut buf))
			.await
			.expect("upgrade timed out")
			.expect("read failed");
		assert!(n > 0, "server closed during handshake");
		response.extend_from_slice(&buf[..n]);
	}

	let text = String::from_utf8_lossy(&response);
	assert!(text.starts_with("HTTP/1.1 101"), "unexpected status: {text}");
	assert!(
		text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
		"bad accept header: {text}"
	);
	client
}

async fn read_ws_frame(client: &mut TcpStream, parser: &mut WsFrameParser) -> chirp_net::websocket::WsFrame {
	let mut buf = [0u8; 4096];
	loop {
		if let Some(f) = parser.pop_frame() {
			return f;
		}
		let n = timeout(Duration::from_secs(5), client.read(&mut buf))
			.await
			.expect("ws read timed out")
			.expect("read failed");
		assert!(n > 0, "peer closed while waiting for frame");
		parser.append(&buf[..n]);
	}
}

#[tokio::test]
async fn websocket_upgrade_then_binary_envelope_round_trip() {
	let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, _closes_rx) = mpsc::unbounded_channel();
	let server = WebSocketServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = ws_upgrade(server.local_addr()).await;

	// Client frames are masked; payload is a length-prefixed envelope.
	let envelope = frame_of(b"payload-bytes");
	client
		.write_all(&build_frame(OPCODE_BINARY, &envelope, true))
		.await
		.expect("write frame");

	let got = timeout(Duration::from_secs(5), frames_rx.recv())
		.await
		.expect("frame timed out")
		.expect("handler alive");
	assert_eq!(got, b"payload-bytes");

	// The echo comes back as an unmasked binary frame wrapping the envelope.
	let mut parser = WsFrameParser::new();
	let reply = read_ws_frame(&mut client, &mut parser).await;
	assert_eq!(reply.opcode, OPCODE_BINARY);
	assert_eq!(reply.payload, frame_of(b"payload-bytes"));
}

#[tokio::test]
async fn websocket_ping_gets_pong_with_same_payload() {
	let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, _closes_rx) = mpsc::unbounded_channel();
	let server = WebSocketServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = ws_upgrade(server.local_addr()).await;
	client
		.write_all(&build_frame(OPCODE_PING, b"ping-payload", true))
		.await
		.expect("write ping");

	let mut parser = WsFrameParser::new();
	let reply = read_ws_frame(&mut client, &mut parser).await;
	assert_eq!(reply.opcode, OPCODE_PONG);
	assert_eq!(reply.payload, b"ping-payload");
}

#[tokio::test]
async fn websocket_close_frame_is_answered_then_closed() {
	let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, mut closes_rx) = mpsc::unbounded_channel();
	let server = WebSocketServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = ws_upgrade(server.local_addr()).await;
	client
		.write_all(&build_frame(OPCODE_CLOSE, &[], true))
		.await
		.expect("write close");

	let mut parser = WsFrameParser::new();
	let reply = read_ws_frame(&mut client, &mut parser).await;
	assert_eq!(reply.opcode, OPCODE_CLOSE);

	let _ = timeout(Duration::from_secs(5), closes_rx.recv())
		.await
		.expect("close timed out")
		.expect("handler alive");
}

#[tokio::test]
async fn websocket_fragmented_frame_closes_the_connection() {
	let (frames_tx, _frames_rx) = mpsc::unbounded_channel();
	let (closes_tx, mut closes_rx) = mpsc::unbounded_channel();
	let server = WebSocketServer::bind(([127, 0, 0, 1], 0).into(), Arc::new(EchoHandler {
		frames: frames_tx,
		closes: closes_tx,
	}))
	.await
	.expect("bind");

	let mut client = ws_upgrade(server.local_addr()).await;

	// FIN=0 binary frame (no reassembly support).
	let mut fragment = build_frame(OPCODE_BINARY, b"partial", true);
	fragment[0] &= 0x7F;
	client.write_all(&fragment).await.expect("write fragment");

	let _ = timeout(Duration::from_secs(5), closes_rx.recv())
		.await
		.expect("close timed out")
		.expect("handler alive");
}
