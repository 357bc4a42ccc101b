#![forbid(unsafe_code)]

//! Client SDK for the Chirp gateway protocol.
//!
//! `ChatClient` owns a single-threaded reactor on a dedicated thread; every
//! public method just enqueues a command, so none of them block.

use std::sync::Arc;

use thiserror::Error;

mod client;

pub use client::ChatClient;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
	pub gateway_host: String,
	pub gateway_port: u16,

	/// Heartbeat period; disabled when `<= 0`.
	pub heartbeat_interval_seconds: i64,
}

impl Default for ChatConfig {
	fn default() -> Self {
		Self {
			gateway_host: "localhost".to_string(),
			gateway_port: 5000,
			heartbeat_interval_seconds: 30,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	LoggedIn,
}

impl ConnectionState {
	pub(crate) fn from_u8(v: u8) -> Self {
		match v {
			1 => ConnectionState::Connecting,
			2 => ConnectionState::Connected,
			3 => ConnectionState::LoggedIn,
			_ => ConnectionState::Disconnected,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
	#[error("not connected")]
	NotConnected,
	#[error("already connected")]
	AlreadyConnected,
	#[error("login failed")]
	LoginFailed,
	#[error("send failed")]
	SendFailed,
	#[error("invalid parameter")]
	InvalidParam,
	#[error("transport error: {0}")]
	Transport(String),
}

/// `(sender_id, content)` of an incoming chat message.
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Kick reason delivered by the server.
pub type KickCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection loss, with the underlying error.
pub type DisconnectCallback = Arc<dyn Fn(&ChatError) + Send + Sync>;

pub(crate) type LoginCallback = Box<dyn FnOnce(Result<String, ChatError>) + Send>;
