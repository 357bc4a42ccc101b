#![forbid(unsafe_code)]

//! Gateway packet dispatcher: login/logout handshakes and heartbeats, on
//! both transports.

use std::sync::Arc;

use chirp_common::id::random_hex;
use chirp_common::time::unix_ms_now;
use chirp_net::{SessionHandle, SessionHandler};
use chirp_protocol::pb::{
	ErrorCode, HeartbeatPing, HeartbeatPong, KickNotify, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse,
	MsgId, Packet,
};
use chirp_protocol::{decode_body, encode_packet};
use prost::Message;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::auth_client::{AuthClient, internal_login_error, internal_logout_error};
use crate::redis_session::RedisSessionManager;
use crate::state::GatewayState;

pub const KICK_REASON_LOCAL: &str = "login from another device";
pub const KICK_REASON_REMOTE: &str = "login from another gateway instance";

pub fn send_packet<M: Message>(session: &SessionHandle, msg_id: MsgId, sequence: i64, body: &M) {
	session.send(encode_packet(msg_id, sequence, body.encode_to_vec()));
}

pub fn send_packet_and_close<M: Message>(session: &SessionHandle, msg_id: MsgId, sequence: i64, body: &M) {
	session.send_and_close(encode_packet(msg_id, sequence, body.encode_to_vec()));
}

/// Deliver `KICK_NOTIFY` (sequence 0) and close once it flushes.
pub fn kick_session(session: &SessionHandle, reason: &str) {
	let kick = KickNotify {
		reason: if reason.is_empty() { "kicked".to_string() } else { reason.to_string() },
	};
	metrics::counter!("chirp_gateway_kicks_total").increment(1);
	send_packet_and_close(session, MsgId::KickNotify, 0, &kick);
}

pub struct GatewayDispatcher {
	state: Arc<Mutex<GatewayState>>,
	auth: Option<Arc<AuthClient>>,
	redis: Option<Arc<RedisSessionManager>>,
}

impl GatewayDispatcher {
	pub fn new(auth: Option<AuthClient>, redis: Option<Arc<RedisSessionManager>>) -> Self {
		Self {
			state: Arc::new(Mutex::new(GatewayState::default())),
			auth: auth.map(Arc::new),
			redis,
		}
	}

	pub fn state(&self) -> Arc<Mutex<GatewayState>> {
		Arc::clone(&self.state)
	}

	/// Kick signal from another instance: close our local session for the
	/// user, if one is still bound.
	pub async fn handle_remote_kick(&self, user_id: &str) {
		let session = self.state.lock().await.session_for_user(user_id);
		if let Some(session) = session {
			info!(user = %user_id, "closing session kicked by another instance");
			kick_session(&session, KICK_REASON_REMOTE);
		}
	}

	async fn handle_login(&self, session: SessionHandle, pkt: Packet) {
		let sequence = pkt.sequence;
		let req = match decode_body::<LoginRequest>(&pkt.body) {
			Ok(req) => req,
			Err(_) => {
				let resp = LoginResponse {
					code: ErrorCode::InvalidParam as i32,
					server_time: unix_ms_now(),
					..Default::default()
				};
				send_packet(&session, MsgId::LoginResp, sequence, &resp);
				return;
			}
		};

		metrics::counter!("chirp_gateway_login_requests_total").increment(1);

		let Some(auth) = &self.auth else {
			// Scaffolding mode: the token is the user id; no ownership update.
			let code = if req.token.is_empty() {
				ErrorCode::InvalidParam
			} else {
				ErrorCode::Ok
			};
			let resp = LoginResponse {
				code: code as i32,
				user_id: req.token.clone(),
				session_id: random_hex(16),
				server_time: unix_ms_now(),
				kick_previous: true,
				kick: Some(KickNotify {
					reason: KICK_REASON_LOCAL.to_string(),
				}),
			};
			send_packet(&session, MsgId::LoginResp, sequence, &resp);
			return;
		};

		// Run the RPC continuation off the session task so reads keep going.
		let token = req.token.clone();
		let rx = auth.login(req, sequence);
		let state = Arc::clone(&self.state);
		let redis = self.redis.clone();
		tokio::spawn(async move {
			let resp = rx.await.unwrap_or_else(|_| internal_login_error());
			if resp.code != ErrorCode::Ok as i32 {
				send_packet(&session, MsgId::LoginResp, sequence, &resp);
				return;
			}

			let user_id = if resp.user_id.is_empty() { token } else { resp.user_id.clone() };
			if user_id.is_empty() {
				let err = LoginResponse {
					code: ErrorCode::InvalidParam as i32,
					server_time: unix_ms_now(),
					..Default::default()
				};
				send_packet(&session, MsgId::LoginResp, sequence, &err);
				return;
			}

			let old = state.lock().await.bind_user(&session, &user_id, &resp.session_id);
			if let Some(old) = old {
				let reason = resp
					.kick
					.as_ref()
					.map(|k| k.reason.clone())
					.unwrap_or_else(|| KICK_REASON_LOCAL.to_string());
				debug!(user = %user_id, old_session = old.id(), "kicking previous session");
				kick_session(&old, &reason);
			}

			// Ack only after the claim completes, so cross-instance kicks have
			// reached the previous owner first.
			if let Some(redis) = &redis {
				let _prev_owner = redis.claim(&user_id).await.unwrap_or(None);
			}
			info!(user = %user_id, session = session.id(), "login complete");
			send_packet(&session, MsgId::LoginResp, sequence, &resp);
		});
	}

	async fn handle_logout(&self, session: SessionHandle, pkt: Packet) {
		let sequence = pkt.sequence;
		let req = match decode_body::<LogoutRequest>(&pkt.body) {
			Ok(req) => req,
			Err(_) => {
				let resp = LogoutResponse {
					code: ErrorCode::InvalidParam as i32,
					server_time: unix_ms_now(),
				};
				send_packet(&session, MsgId::LogoutResp, sequence, &resp);
				return;
			}
		};

		if req.user_id.is_empty() {
			let resp = LogoutResponse {
				code: ErrorCode::InvalidParam as i32,
				server_time: unix_ms_now(),
			};
			send_packet(&session, MsgId::LogoutResp, sequence, &resp);
			return;
		}

		let bound = self.state.lock().await.bound_user(&session);
		let (cur_user, cur_session_id) = bound.unwrap_or_default();
		if cur_user.is_empty() || cur_user != req.user_id {
			let resp = LogoutResponse {
				code: ErrorCode::AuthFailed as i32,
				server_time: unix_ms_now(),
			};
			send_packet(&session, MsgId::LogoutResp, sequence, &resp);
			return;
		}
		if !req.session_id.is_empty() && !cur_session_id.is_empty() && req.session_id != cur_session_id {
			let resp = LogoutResponse {
				code: ErrorCode::SessionExpired as i32,
				server_time: unix_ms_now(),
			};
			send_packet(&session, MsgId::LogoutResp, sequence, &resp);
			return;
		}

		match &self.auth {
			Some(auth) => {
				let rx = auth.logout(req.clone(), sequence);
				let state = Arc::clone(&self.state);
				let redis = self.redis.clone();
				tokio::spawn(async move {
					let resp = rx.await.unwrap_or_else(|_| internal_logout_error());
					finalize_logout(&state, redis.as_deref(), &session, &req, sequence, resp).await;
				});
			}
			None => {
				let resp = LogoutResponse {
					code: ErrorCode::Ok as i32,
					server_time: unix_ms_now(),
				};
				finalize_logout(&self.state, self.redis.as_deref(), &session, &req, sequence, resp).await;
			}
		}
	}

	fn handle_heartbeat(&self, session: &SessionHandle, pkt: &Packet) {
		let ping = match decode_body::<HeartbeatPing>(&pkt.body) {
			Ok(ping) => ping,
			Err(_) => {
				warn!("failed to parse HeartbeatPing body");
				return;
			}
		};

		let pong = HeartbeatPong {
			timestamp: ping.timestamp,
			server_time: unix_ms_now(),
		};
		send_packet(session, MsgId::HeartbeatPong, pkt.sequence, &pong);
	}
}

async fn finalize_logout(
	state: &Mutex<GatewayState>,
	redis: Option<&RedisSessionManager>,
	session: &SessionHandle,
	req: &LogoutRequest,
	sequence: i64,
	resp: LogoutResponse,
) {
	if resp.code != ErrorCode::Ok as i32 {
		send_packet(session, MsgId::LogoutResp, sequence, &resp);
		return;
	}

	let released = state.lock().await.remove_session(session);
	if let Some(user_id) = released
		&& let Some(redis) = redis
	{
		redis.release(&user_id);
	}
	info!(user = %req.user_id, session = session.id(), "logout complete");
	send_packet_and_close(session, MsgId::LogoutResp, sequence, &resp);
}

#[async_trait::async_trait]
impl SessionHandler for GatewayDispatcher {
	async fn on_frame(&self, session: SessionHandle, payload: Vec<u8>) {
		let pkt = match decode_body::<Packet>(&payload) {
			Ok(pkt) => pkt,
			Err(_) => {
				warn!(session = session.id(), "failed to parse packet from client");
				return;
			}
		};

		match pkt.kind() {
			MsgId::LoginReq => self.handle_login(session, pkt).await,
			MsgId::LogoutReq => self.handle_logout(session, pkt).await,
			MsgId::HeartbeatPing => self.handle_heartbeat(&session, &pkt),
			// Forward-compatible: unknown/unhandled kinds are ignored.
			_ => {}
		}
	}

	async fn on_close(&self, session: SessionHandle) {
		let released = self.state.lock().await.remove_session(&session);
		if let Some(user_id) = released {
			debug!(user = %user_id, session = session.id(), "session closed; binding swept");
			if let Some(redis) = &self.redis {
				redis.release(&user_id);
			}
		}
	}
}

/// Consume remote-kick user ids on the gateway reactor.
pub fn spawn_kick_listener(dispatcher: Arc<GatewayDispatcher>, mut kick_rx: mpsc::UnboundedReceiver<String>) {
	tokio::spawn(async move {
		while let Some(user_id) = kick_rx.recv().await {
			dispatcher.handle_remote_kick(&user_id).await;
		}
	});
}
