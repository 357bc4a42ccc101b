#![forbid(unsafe_code)]

//! Auth packet dispatcher: credential checks, no connection state.

use chirp_common::id::random_hex;
use chirp_common::time::unix_ms_now;
use chirp_common::token::{looks_like_jwt, verify_hs256};
use chirp_net::{SessionHandle, SessionHandler};
use chirp_protocol::pb::{
	ErrorCode, KickNotify, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, MsgId, Packet,
};
use chirp_protocol::{decode_body, encode_packet};
use prost::Message;
use tracing::{debug, warn};

fn send_packet<M: Message>(session: &SessionHandle, msg_id: MsgId, sequence: i64, body: &M) {
	session.send(encode_packet(msg_id, sequence, body.encode_to_vec()));
}

pub struct AuthDispatcher {
	jwt_secret: String,
}

impl AuthDispatcher {
	pub fn new(jwt_secret: impl Into<String>) -> Self {
		Self {
			jwt_secret: jwt_secret.into(),
		}
	}

	fn handle_login(&self, session: &SessionHandle, pkt: &Packet) {
		let req = match decode_body::<LoginRequest>(&pkt.body) {
			Ok(req) => req,
			Err(_) => {
				let resp = LoginResponse {
					code: ErrorCode::InvalidParam as i32,
					server_time: unix_ms_now(),
					..Default::default()
				};
				send_packet(session, MsgId::LoginResp, pkt.sequence, &resp);
				return;
			}
		};

		let user_id = if looks_like_jwt(&req.token) {
			match verify_hs256(&req.token, &self.jwt_secret) {
				Ok(claims) => claims.sub,
				Err(e) => {
					debug!(error = %e, "jwt rejected");
					metrics::counter!("chirp_auth_rejected_tokens_total").increment(1);
					let resp = LoginResponse {
						code: ErrorCode::AuthFailed as i32,
						server_time: unix_ms_now(),
						..Default::default()
					};
					send_packet(session, MsgId::LoginResp, pkt.sequence, &resp);
					return;
				}
			}
		} else {
			// Scaffolding fallback: treat the token as the user id.
			req.token
		};

		let resp = if user_id.is_empty() {
			LoginResponse {
				code: ErrorCode::InvalidParam as i32,
				server_time: unix_ms_now(),
				..Default::default()
			}
		} else {
			LoginResponse {
				code: ErrorCode::Ok as i32,
				user_id,
				session_id: random_hex(16),
				server_time: unix_ms_now(),
				kick_previous: true,
				kick: Some(KickNotify {
					reason: "login from another device".to_string(),
				}),
			}
		};
		send_packet(session, MsgId::LoginResp, pkt.sequence, &resp);
	}

	fn handle_logout(&self, session: &SessionHandle, pkt: &Packet) {
		let code = match decode_body::<LogoutRequest>(&pkt.body) {
			Ok(req) if !req.user_id.is_empty() && !req.session_id.is_empty() => ErrorCode::Ok,
			_ => ErrorCode::InvalidParam,
		};

		let resp = LogoutResponse {
			code: code as i32,
			server_time: unix_ms_now(),
		};
		send_packet(session, MsgId::LogoutResp, pkt.sequence, &resp);
	}
}

#[async_trait::async_trait]
impl SessionHandler for AuthDispatcher {
	async fn on_frame(&self, session: SessionHandle, payload: Vec<u8>) {
		let pkt = match decode_body::<Packet>(&payload) {
			Ok(pkt) => pkt,
			Err(_) => {
				warn!(session = session.id(), "failed to parse packet from client");
				return;
			}
		};

		match pkt.kind() {
			MsgId::LoginReq => self.handle_login(&session, &pkt),
			MsgId::LogoutReq => self.handle_logout(&session, &pkt),
			_ => {}
		}
	}
}
