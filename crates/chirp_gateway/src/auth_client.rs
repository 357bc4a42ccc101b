#![forbid(unsafe_code)]

//! Serialized RPC client to the Auth service.
//!
//! Jobs run on one dedicated worker thread so blocking connect/read never
//! touches the async reactor; callers await a oneshot for the typed
//! response. Any failure surfaces as `INTERNAL_ERROR`, never as a transport
//! error.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context as _, anyhow};
use chirp_common::time::unix_ms_now;
use chirp_protocol::framing::LEN_PREFIX_BYTES;
use chirp_protocol::pb::{ErrorCode, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, MsgId, Packet};
use chirp_protocol::{decode_body, encode_packet};
use tokio::sync::oneshot;
use tracing::warn;

enum Job {
	Login {
		req: LoginRequest,
		sequence: i64,
		reply: oneshot::Sender<LoginResponse>,
	},
	Logout {
		req: LogoutRequest,
		sequence: i64,
		reply: oneshot::Sender<LogoutResponse>,
	},
}

pub struct AuthClient {
	tx: Option<mpsc::Sender<Job>>,
	worker: Option<JoinHandle<()>>,
}

impl AuthClient {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		let host = host.into();
		let (tx, rx) = mpsc::channel::<Job>();
		let worker = std::thread::spawn(move || run_worker(&host, port, rx));
		Self {
			tx: Some(tx),
			worker: Some(worker),
		}
	}

	/// Queue a login RPC; resolve the returned receiver for the response.
	pub fn login(&self, req: LoginRequest, sequence: i64) -> oneshot::Receiver<LoginResponse> {
		let (reply, rx) = oneshot::channel();
		if let Some(tx) = &self.tx {
			let _ = tx.send(Job::Login { req, sequence, reply });
		}
		rx
	}

	pub fn logout(&self, req: LogoutRequest, sequence: i64) -> oneshot::Receiver<LogoutResponse> {
		let (reply, rx) = oneshot::channel();
		if let Some(tx) = &self.tx {
			let _ = tx.send(Job::Logout { req, sequence, reply });
		}
		rx
	}
}

impl Drop for AuthClient {
	fn drop(&mut self) {
		// Closing the channel lets the worker drain in-flight jobs and exit.
		self.tx.take();
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
	}
}

/// Fallback used when the RPC failed or the receiver was dropped.
pub fn internal_login_error() -> LoginResponse {
	LoginResponse {
		code: ErrorCode::InternalError as i32,
		server_time: unix_ms_now(),
		..Default::default()
	}
}

pub fn internal_logout_error() -> LogoutResponse {
	LogoutResponse {
		code: ErrorCode::InternalError as i32,
		server_time: unix_ms_now(),
	}
}

fn run_worker(host: &str, port: u16, rx: mpsc::Receiver<Job>) {
	for job in rx {
		match job {
			Job::Login { req, sequence, reply } => {
				let frame = encode_packet(MsgId::LoginReq, sequence, prost::Message::encode_to_vec(&req));
				let resp = match rpc_roundtrip(host, port, &frame, MsgId::LoginResp) {
					Ok(pkt) => decode_body::<LoginResponse>(&pkt.body).map_err(anyhow::Error::from),
					Err(e) => Err(e),
				}
				.unwrap_or_else(|e| {
					warn!(error = %e, "auth login rpc failed");
					metrics::counter!("chirp_gateway_auth_rpc_failures_total").increment(1);
					internal_login_error()
				});
				let _ = reply.send(resp);
			}
			Job::Logout { req, sequence, reply } => {
				let frame = encode_packet(MsgId::LogoutReq, sequence, prost::Message::encode_to_vec(&req));
				let resp = match rpc_roundtrip(host, port, &frame, MsgId::LogoutResp) {
					Ok(pkt) => decode_body::<LogoutResponse>(&pkt.body).map_err(anyhow::Error::from),
					Err(e) => Err(e),
				}
				.unwrap_or_else(|e| {
					warn!(error = %e, "auth logout rpc failed");
					metrics::counter!("chirp_gateway_auth_rpc_failures_total").increment(1);
					internal_logout_error()
				});
				let _ = reply.send(resp);
			}
		}
	}
}

/// Fresh connection per job: send one framed request, read one framed
/// response, check the response kind.
fn rpc_roundtrip(host: &str, port: u16, frame: &[u8], expect: MsgId) -> anyhow::Result<Packet> {
	let mut stream = TcpStream::connect((host, port)).with_context(|| format!("connect auth at {host}:{port}"))?;
	stream.write_all(frame).context("write auth request")?;

	let mut len_be = [0u8; LEN_PREFIX_BYTES];
	stream.read_exact(&mut len_be).context("read auth frame length")?;
	let len = u32::from_be_bytes(len_be) as usize;

	let mut payload = vec![0u8; len];
	stream.read_exact(&mut payload).context("read auth frame payload")?;

	let pkt: Packet = decode_body(&payload).context("parse auth response packet")?;
	if pkt.kind() != expect {
		return Err(anyhow!("unexpected auth response kind: {:?}", pkt.kind()));
	}
	Ok(pkt)
}
