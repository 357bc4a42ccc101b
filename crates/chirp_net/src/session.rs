#![forbid(unsafe_code)]

//! Session surface shared by the TCP and WebSocket transports.
//!
//! A session's socket is owned by its transport task; `SessionHandle` is an
//! indirect handle that enqueues write commands. All per-session state lives
//! inside the single task, so writes are serialized and ordered by
//! construction and the close callback fires exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
	Tcp,
	WebSocket,
}

impl TransportKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			TransportKind::Tcp => "tcp",
			TransportKind::WebSocket => "websocket",
		}
	}
}

impl fmt::Display for TransportKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug)]
pub(crate) enum WriteCmd {
	Send(Vec<u8>),
	SendAndClose(Vec<u8>),
	Close,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Shared {
	id: u64,
	peer: SocketAddr,
	transport: TransportKind,
	cmd_tx: mpsc::UnboundedSender<WriteCmd>,
	closed: AtomicBool,
}

/// Cheap cloneable handle to one live session.
#[derive(Clone)]
pub struct SessionHandle {
	shared: Arc<Shared>,
}

impl SessionHandle {
	pub(crate) fn new(peer: SocketAddr, transport: TransportKind) -> (Self, mpsc::UnboundedReceiver<WriteCmd>) {
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let shared = Arc::new(Shared {
			id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
			peer,
			transport,
			cmd_tx,
			closed: AtomicBool::new(false),
		});
		(Self { shared }, cmd_rx)
	}

	/// Process-unique session id; stable for the session's lifetime.
	pub fn id(&self) -> u64 {
		self.shared.id
	}

	pub fn peer_addr(&self) -> SocketAddr {
		self.shared.peer
	}

	pub fn transport(&self) -> TransportKind {
		self.shared.transport
	}

	/// Enqueue bytes for ordered delivery. Never blocks; dropped once closed.
	pub fn send(&self, bytes: Vec<u8>) {
		if self.is_closed() {
			return;
		}
		let _ = self.shared.cmd_tx.send(WriteCmd::Send(bytes));
	}

	/// Enqueue bytes, then close once the write queue has drained.
	pub fn send_and_close(&self, bytes: Vec<u8>) {
		if self.is_closed() {
			return;
		}
		let _ = self.shared.cmd_tx.send(WriteCmd::SendAndClose(bytes));
	}

	/// Close immediately; still-queued writes may be lost.
	pub fn close(&self) {
		let _ = self.shared.cmd_tx.send(WriteCmd::Close);
	}

	pub fn is_closed(&self) -> bool {
		self.shared.closed.load(Ordering::SeqCst)
	}

	/// Returns true only for the first caller.
	pub(crate) fn mark_closed(&self) -> bool {
		!self.shared.closed.swap(true, Ordering::SeqCst)
	}

	pub fn downgrade(&self) -> WeakSessionHandle {
		WeakSessionHandle {
			shared: Arc::downgrade(&self.shared),
		}
	}

	/// Session with no transport behind it; writes are captured by the
	/// returned sink instead of hitting a socket. Intended for tests.
	pub fn in_memory(transport: TransportKind) -> (Self, SessionSink) {
		let peer: SocketAddr = ([127, 0, 0, 1], 0).into();
		let (handle, cmd_rx) = Self::new(peer, transport);
		(handle, SessionSink { cmd_rx })
	}
}

/// Receiving end of an in-memory session: yields each enqueued payload and
/// whether it requested close-after-write.
pub struct SessionSink {
	cmd_rx: mpsc::UnboundedReceiver<WriteCmd>,
}

impl SessionSink {
	pub fn try_next(&mut self) -> Option<(Vec<u8>, bool)> {
		match self.cmd_rx.try_recv().ok()? {
			WriteCmd::Send(bytes) => Some((bytes, false)),
			WriteCmd::SendAndClose(bytes) => Some((bytes, true)),
			WriteCmd::Close => None,
		}
	}

	pub async fn next(&mut self) -> Option<(Vec<u8>, bool)> {
		match self.cmd_rx.recv().await? {
			WriteCmd::Send(bytes) => Some((bytes, false)),
			WriteCmd::SendAndClose(bytes) => Some((bytes, true)),
			WriteCmd::Close => None,
		}
	}
}

impl fmt::Debug for SessionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionHandle")
			.field("id", &self.shared.id)
			.field("peer", &self.shared.peer)
			.field("transport", &self.shared.transport)
			.field("closed", &self.is_closed())
			.finish()
	}
}

/// Non-owning handle; upgrade fails once the transport task has exited.
#[derive(Debug, Clone, Default)]
pub struct WeakSessionHandle {
	shared: Weak<Shared>,
}

impl WeakSessionHandle {
	pub fn upgrade(&self) -> Option<SessionHandle> {
		let shared = self.shared.upgrade()?;
		if shared.closed.load(Ordering::SeqCst) {
			return None;
		}
		Some(SessionHandle { shared })
	}
}

/// Callbacks invoked by the transport tasks.
///
/// `on_frame` receives one complete length-prefixed payload (the envelope
/// bytes, already unwrapped from any WebSocket framing). `on_close` runs
/// exactly once after the socket is torn down, whatever the cause.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync + 'static {
	async fn on_frame(&self, session: SessionHandle, payload: Vec<u8>);

	async fn on_close(&self, _session: SessionHandle) {}
}

/// Flush commands already queued at close-after-write time, then stop.
pub(crate) async fn drain_queued_writes<W, F>(cmd_rx: &mut mpsc::UnboundedReceiver<WriteCmd>, wr: &mut W, wrap: F)
where
	W: AsyncWrite + Unpin,
	F: Fn(Vec<u8>) -> Vec<u8>,
{
	while let Ok(cmd) = cmd_rx.try_recv() {
		match cmd {
			WriteCmd::Send(bytes) | WriteCmd::SendAndClose(bytes) => {
				if wr.write_all(&wrap(bytes)).await.is_err() {
					return;
				}
			}
			WriteCmd::Close => return,
		}
	}
}
