#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use chirp_common::time::unix_ms_now;
use chirp_protocol::pb::{
	ChannelType, ChatMessage, ErrorCode, HeartbeatPing, KickNotify, LoginRequest, LoginResponse, LogoutRequest,
	MsgId, MsgType, Packet, SendMessageRequest,
};
use chirp_protocol::{FrameBuffer, decode_body, encode_packet};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ChatConfig, ChatError, ConnectionState, DisconnectCallback, KickCallback, LoginCallback, MessageCallback};

enum Cmd {
	Connect,
	Disconnect,
	Login { token: String, cb: LoginCallback },
	Logout,
	SendMessage { receiver: String, content: String },
	SetMessageCallback(MessageCallback),
	SetKickCallback(KickCallback),
	SetDisconnectCallback(DisconnectCallback),
	Shutdown,
}

enum Event {
	Frame { epoch: u64, payload: Vec<u8> },
	Closed { epoch: u64, error: Option<String> },
	HeartbeatTick { epoch: u64 },
}

/// Thread-safe chat client handle.
///
/// Dropping the client stops its reactor thread; in-flight logins resolve
/// with `NotConnected`.
pub struct ChatClient {
	cmd_tx: mpsc::UnboundedSender<Cmd>,
	state: Arc<AtomicU8>,
	thread: Option<std::thread::JoinHandle<()>>,
}

impl ChatClient {
	pub fn new(config: ChatConfig) -> anyhow::Result<Self> {
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let state = Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8));

		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.context("build sdk runtime")?;

		let state_for_core = Arc::clone(&state);
		let thread = std::thread::Builder::new()
			.name("chirp-sdk".to_string())
			.spawn(move || runtime.block_on(run_client(config, cmd_rx, state_for_core)))
			.context("spawn sdk thread")?;

		Ok(Self {
			cmd_tx,
			state,
			thread: Some(thread),
		})
	}

	pub fn state(&self) -> ConnectionState {
		ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
	}

	pub fn connect(&self) {
		let _ = self.cmd_tx.send(Cmd::Connect);
	}

	pub fn disconnect(&self) {
		let _ = self.cmd_tx.send(Cmd::Disconnect);
	}

	/// One-shot login; `cb` resolves with the user id or the failure.
	pub fn login(&self, token: impl Into<String>, cb: impl FnOnce(Result<String, ChatError>) + Send + 'static) {
		let _ = self.cmd_tx.send(Cmd::Login {
			token: token.into(),
			cb: Box::new(cb),
		});
	}

	pub fn logout(&self) {
		let _ = self.cmd_tx.send(Cmd::Logout);
	}

	/// Fire-and-forget private message; requires `LoggedIn`.
	pub fn send_message(&self, receiver: impl Into<String>, content: impl Into<String>) {
		let _ = self.cmd_tx.send(Cmd::SendMessage {
			receiver: receiver.into(),
			content: content.into(),
		});
	}

	pub fn set_message_callback(&self, cb: MessageCallback) {
		let _ = self.cmd_tx.send(Cmd::SetMessageCallback(cb));
	}

	pub fn set_kick_callback(&self, cb: KickCallback) {
		let _ = self.cmd_tx.send(Cmd::SetKickCallback(cb));
	}

	pub fn set_disconnect_callback(&self, cb: DisconnectCallback) {
		let _ = self.cmd_tx.send(Cmd::SetDisconnectCallback(cb));
	}
}

impl Drop for ChatClient {
	fn drop(&mut self) {
		let _ = self.cmd_tx.send(Cmd::Shutdown);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

struct ClientCore {
	config: ChatConfig,
	state: Arc<AtomicU8>,

	writer: Option<OwnedWriteHalf>,
	reader_task: Option<JoinHandle<()>>,
	heartbeat_task: Option<JoinHandle<()>>,
	/// Bumped on every (re)connect; events from stale tasks are ignored.
	epoch: u64,

	next_seq: i64,
	user_id: String,
	session_id: String,

	pending_logins: HashMap<i64, LoginCallback>,
	on_message: Option<MessageCallback>,
	on_kick: Option<KickCallback>,
	on_disconnect: Option<DisconnectCallback>,

	event_tx: mpsc::UnboundedSender<Event>,
}

impl ClientCore {
	fn set_state(&self, s: ConnectionState) {
		self.state.store(s as u8, Ordering::SeqCst);
	}

	fn state(&self) -> ConnectionState {
		ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
	}

	async fn connect(&mut self) {
		if self.state() != ConnectionState::Disconnected {
			return;
		}
		self.set_state(ConnectionState::Connecting);

		let addr = (self.config.gateway_host.as_str(), self.config.gateway_port);
		let stream = match TcpStream::connect(addr).await {
			Ok(s) => s,
			Err(e) => {
				self.set_state(ConnectionState::Disconnected);
				self.notify_disconnect(&ChatError::Transport(e.to_string()));
				return;
			}
		};

		let (rd, wr) = stream.into_split();
		self.epoch += 1;
		self.writer = Some(wr);
		self.user_id.clear();
		self.session_id.clear();
		self.reader_task = Some(tokio::spawn(read_loop(rd, self.epoch, self.event_tx.clone())));
		self.heartbeat_task = if self.config.heartbeat_interval_seconds > 0 {
			let period = Duration::from_secs(self.config.heartbeat_interval_seconds as u64);
			let epoch = self.epoch;
			let event_tx = self.event_tx.clone();
			Some(tokio::spawn(async move {
				loop {
					tokio::time::sleep(period).await;
					if event_tx.send(Event::HeartbeatTick { epoch }).is_err() {
						return;
					}
				}
			}))
		} else {
			None
		};
		self.set_state(ConnectionState::Connected);
		debug!(host = %self.config.gateway_host, port = self.config.gateway_port, "sdk connected");
	}

	async fn send_packet(&mut self, msg_id: MsgId, sequence: i64, body: Vec<u8>) {
		let Some(writer) = self.writer.as_mut() else {
			return;
		};
		if let Err(e) = writer.write_all(&encode_packet(msg_id, sequence, body)).await {
			self.close(true, Some(ChatError::Transport(e.to_string())));
		}
	}

	async fn login(&mut self, token: String, cb: LoginCallback) {
		if token.is_empty() {
			cb(Err(ChatError::InvalidParam));
			return;
		}
		if self.state() != ConnectionState::Connected {
			cb(Err(ChatError::NotConnected));
			return;
		}

		let req = LoginRequest {
			token,
			device_id: "sdk_device".to_string(),
			platform: "pc".to_string(),
		};
		let sequence = self.next_seq;
		self.next_seq += 1;
		self.pending_logins.insert(sequence, cb);
		self.send_packet(MsgId::LoginReq, sequence, req.encode_to_vec()).await;
	}

	async fn logout(&mut self) {
		if self.state() != ConnectionState::LoggedIn {
			return;
		}

		let req = LogoutRequest {
			user_id: self.user_id.clone(),
			session_id: self.session_id.clone(),
		};
		let sequence = self.next_seq;
		self.next_seq += 1;
		self.send_packet(MsgId::LogoutReq, sequence, req.encode_to_vec()).await;

		self.close(false, None);
		self.set_state(ConnectionState::Disconnected);
	}

	async fn send_message(&mut self, receiver: String, content: String) {
		if self.state() != ConnectionState::LoggedIn || receiver.is_empty() {
			return;
		}

		let channel_id = if self.user_id <= receiver {
			format!("{}|{receiver}", self.user_id)
		} else {
			format!("{receiver}|{}", self.user_id)
		};
		let req = SendMessageRequest {
			sender_id: self.user_id.clone(),
			receiver_id: receiver,
			channel_type: ChannelType::Private as i32,
			channel_id,
			msg_type: MsgType::Text as i32,
			content,
			client_timestamp: unix_ms_now(),
		};
		let sequence = self.next_seq;
		self.next_seq += 1;
		self.send_packet(MsgId::SendMessageReq, sequence, req.encode_to_vec()).await;
	}

	async fn send_heartbeat(&mut self) {
		if self.writer.is_none() {
			return;
		}
		let ping = HeartbeatPing { timestamp: unix_ms_now() };
		let sequence = self.next_seq;
		self.next_seq += 1;
		self.send_packet(MsgId::HeartbeatPing, sequence, ping.encode_to_vec()).await;
	}

	fn handle_frame(&mut self, payload: &[u8]) {
		let Ok(pkt) = decode_body::<Packet>(payload) else {
			return;
		};

		match pkt.kind() {
			MsgId::LoginResp => self.handle_login_resp(&pkt),
			MsgId::KickNotify => {
				if let Ok(kick) = decode_body::<KickNotify>(&pkt.body)
					&& let Some(cb) = &self.on_kick
				{
					cb(&kick.reason);
				}
			}
			MsgId::ChatMessageNotify => {
				if let Ok(msg) = decode_body::<ChatMessage>(&pkt.body)
					&& let Some(cb) = &self.on_message
				{
					cb(&msg.sender_id, &msg.content);
				}
			}
			_ => {}
		}
	}

	fn handle_login_resp(&mut self, pkt: &Packet) {
		let resp = match decode_body::<LoginResponse>(&pkt.body) {
			Ok(resp) => resp,
			Err(_) => {
				self.complete_login(pkt.sequence, Err(ChatError::LoginFailed));
				return;
			}
		};

		if resp.code != ErrorCode::Ok as i32 {
			self.complete_login(pkt.sequence, Err(ChatError::LoginFailed));
			return;
		}

		self.user_id = resp.user_id.clone();
		self.session_id = resp.session_id;
		self.set_state(ConnectionState::LoggedIn);
		self.complete_login(pkt.sequence, Ok(resp.user_id));
	}

	fn complete_login(&mut self, sequence: i64, result: Result<String, ChatError>) {
		if let Some(cb) = self.pending_logins.remove(&sequence) {
			cb(result);
		}
	}

	/// Tear the connection down once; pending logins resolve with the
	/// underlying error (or `NotConnected`).
	fn close(&mut self, notify: bool, error: Option<ChatError>) {
		if self.writer.is_none() && self.reader_task.is_none() && self.heartbeat_task.is_none() {
			return;
		}

		self.epoch += 1;
		self.writer = None;
		if let Some(task) = self.heartbeat_task.take() {
			task.abort();
		}
		if let Some(task) = self.reader_task.take() {
			task.abort();
		}

		let login_err = error.clone().unwrap_or(ChatError::NotConnected);
		for (_, cb) in self.pending_logins.drain() {
			cb(Err(login_err.clone()));
		}

		if notify {
			let err = error.unwrap_or(ChatError::NotConnected);
			self.notify_disconnect(&err);
		}
	}

	fn notify_disconnect(&self, err: &ChatError) {
		if let Some(cb) = &self.on_disconnect {
			cb(err);
		}
	}
}

async fn read_loop(mut rd: OwnedReadHalf, epoch: u64, event_tx: mpsc::UnboundedSender<Event>) {
	let mut framer = FrameBuffer::new();
	let mut buf = [0u8; 4096];

	loop {
		match rd.read(&mut buf).await {
			Ok(0) => {
				let _ = event_tx.send(Event::Closed { epoch, error: None });
				return;
			}
			Err(e) => {
				let _ = event_tx.send(Event::Closed {
					epoch,
					error: Some(e.to_string()),
				});
				return;
			}
			Ok(n) => {
				framer.append(&buf[..n]);
				while let Some(payload) = framer.pop_frame() {
					if event_tx.send(Event::Frame { epoch, payload }).is_err() {
						return;
					}
				}
			}
		}
	}
}

async fn run_client(config: ChatConfig, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>, state: Arc<AtomicU8>) {
	let (event_tx, mut event_rx) = mpsc::unbounded_channel();
	let mut core = ClientCore {
		config,
		state,
		writer: None,
		reader_task: None,
		heartbeat_task: None,
		epoch: 0,
		next_seq: 1,
		user_id: String::new(),
		session_id: String::new(),
		pending_logins: HashMap::new(),
		on_message: None,
		on_kick: None,
		on_disconnect: None,
		event_tx,
	};

	loop {
		tokio::select! {
			cmd = cmd_rx.recv() => match cmd {
				None | Some(Cmd::Shutdown) => break,
				Some(Cmd::Connect) => core.connect().await,
				Some(Cmd::Disconnect) => {
					core.close(false, None);
					core.set_state(ConnectionState::Disconnected);
				}
				Some(Cmd::Login { token, cb }) => core.login(token, cb).await,
				Some(Cmd::Logout) => core.logout().await,
				Some(Cmd::SendMessage { receiver, content }) => core.send_message(receiver, content).await,
				Some(Cmd::SetMessageCallback(cb)) => core.on_message = Some(cb),
				Some(Cmd::SetKickCallback(cb)) => core.on_kick = Some(cb),
				Some(Cmd::SetDisconnectCallback(cb)) => core.on_disconnect = Some(cb),
			},
			ev = event_rx.recv() => match ev {
				None => break,
				Some(Event::Frame { epoch, payload }) => {
					if epoch == core.epoch {
						core.handle_frame(&payload);
					}
				}
				Some(Event::Closed { epoch, error }) => {
					if epoch == core.epoch {
						warn!(error = ?error, "sdk connection closed");
						core.close(true, error.map(ChatError::Transport));
						core.set_state(ConnectionState::Disconnected);
					}
				}
				Some(Event::HeartbeatTick { epoch }) => {
					if epoch == core.epoch {
						core.send_heartbeat().await;
					}
				}
			},
		}
	}

	core.close(false, None);
	core.set_state(ConnectionState::Disconnected);
}
