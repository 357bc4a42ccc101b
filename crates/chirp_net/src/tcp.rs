#![forbid(unsafe_code)]

//! Raw-TCP transport: acceptor plus per-connection session task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use chirp_protocol::FrameBuffer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::{SessionHandle, SessionHandler, TransportKind, WriteCmd, drain_queued_writes};

/// Listening acceptor; each accepted socket becomes a session.
pub struct TcpServer {
	local_addr: SocketAddr,
	accept_task: JoinHandle<()>,
}

impl TcpServer {
	pub async fn bind(addr: SocketAddr, handler: Arc<dyn SessionHandler>) -> anyhow::Result<Self> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("bind tcp listener on {addr}"))?;
		let local_addr = listener.local_addr().context("tcp listener local addr")?;

		let accept_task = tokio::spawn(accept_loop(listener, handler));
		Ok(Self { local_addr, accept_task })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Stop accepting; established sessions keep running.
	pub fn shutdown(&self) {
		self.accept_task.abort();
	}
}

impl Drop for TcpServer {
	fn drop(&mut self) {
		self.accept_task.abort();
	}
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn SessionHandler>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				metrics::counter!("chirp_tcp_connections_total").increment(1);
				debug!(%peer, "accepted tcp connection");
				let handler = Arc::clone(&handler);
				tokio::spawn(run_session(stream, peer, handler));
			}
			Err(e) => {
				warn!(error = %e, "tcp accept failed");
			}
		}
	}
}

async fn run_session(stream: TcpStream, peer: SocketAddr, handler: Arc<dyn SessionHandler>) {
	let (handle, mut cmd_rx) = SessionHandle::new(peer, TransportKind::Tcp);
	let (mut rd, mut wr) = stream.into_split();

	let mut framer = FrameBuffer::new();
	let mut buf = [0u8; 4096];

	'session: loop {
		tokio::select! {
			res = rd.read(&mut buf) => match res {
				Ok(0) | Err(_) => break 'session,
				Ok(n) => {
					framer.append(&buf[..n]);
					while let Some(payload) = framer.pop_frame() {
						metrics::counter!("chirp_tcp_frames_in_total").increment(1);
						handler.on_frame(handle.clone(), payload).await;
					}
				}
			},
			cmd = cmd_rx.recv() => match cmd {
				None | Some(WriteCmd::Close) => break 'session,
				Some(WriteCmd::Send(bytes)) => {
					if wr.write_all(&bytes).await.is_err() {
						break 'session;
					}
				}
				Some(WriteCmd::SendAndClose(bytes)) => {
					let _ = wr.write_all(&bytes).await;
					drain_queued_writes(&mut cmd_rx, &mut wr, |b| b).await;
					break 'session;
				}
			},
		}
	}

	handle.mark_closed();
	let _ = wr.shutdown().await;
	debug!(%peer, session = handle.id(), "tcp session closed");
	handler.on_close(handle).await;
}
