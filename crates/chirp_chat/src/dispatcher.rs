#![forbid(unsafe_code)]

//! Chat packet dispatcher: scaffolding login/logout, message send with
//! online-recipient push, and history reads.

use chirp_common::time::unix_ms_now;
use chirp_net::{SessionHandle, SessionHandler};
use chirp_protocol::pb::{
	ChannelType, ChatMessage, ErrorCode, GetHistoryRequest, GetHistoryResponse, KickNotify, LoginRequest,
	LoginResponse, LogoutRequest, LogoutResponse, MsgId, Packet, SendMessageRequest, SendMessageResponse,
};
use chirp_protocol::{decode_body, encode_packet};
use prost::Message;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::state::ChatState;
use crate::store::{MessageStore, generate_message_id, private_channel_id};

const KICK_REASON_LOCAL: &str = "login from another device";

fn send_packet<M: Message>(session: &SessionHandle, msg_id: MsgId, sequence: i64, body: &M) {
	session.send(encode_packet(msg_id, sequence, body.encode_to_vec()));
}

fn kick_session(session: &SessionHandle, reason: &str) {
	let kick = KickNotify {
		reason: if reason.is_empty() { "kicked".to_string() } else { reason.to_string() },
	};
	session.send_and_close(encode_packet(MsgId::KickNotify, 0, kick.encode_to_vec()));
}

#[derive(Default)]
pub struct ChatDispatcher {
	state: Mutex<ChatState>,
	store: Mutex<MessageStore>,
}

impl ChatDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Scaffolding login: the token is the user id.
	async fn handle_login(&self, session: SessionHandle, pkt: Packet) {
		let req = match decode_body::<LoginRequest>(&pkt.body) {
			Ok(req) => req,
			Err(_) => {
				let resp = LoginResponse {
					code: ErrorCode::InvalidParam as i32,
					server_time: unix_ms_now(),
					..Default::default()
				};
				send_packet(&session, MsgId::LoginResp, pkt.sequence, &resp);
				return;
			}
		};

		let user_id = req.token;
		let resp = if user_id.is_empty() {
			LoginResponse {
				code: ErrorCode::InvalidParam as i32,
				server_time: unix_ms_now(),
				..Default::default()
			}
		} else {
			LoginResponse {
				code: ErrorCode::Ok as i32,
				user_id: user_id.clone(),
				session_id: format!("chat_session_{user_id}"),
				server_time: unix_ms_now(),
				kick_previous: true,
				kick: Some(KickNotify {
					reason: KICK_REASON_LOCAL.to_string(),
				}),
			}
		};

		if !user_id.is_empty() {
			let old = self.state.lock().await.bind_user(&session, &user_id);
			if let Some(old) = old {
				debug!(user = %user_id, old_session = old.id(), "kicking previous chat session");
				kick_session(&old, KICK_REASON_LOCAL);
			}
			info!(user = %user_id, session = session.id(), "chat login");
		}

		send_packet(&session, MsgId::LoginResp, pkt.sequence, &resp);
	}

	async fn handle_logout(&self, session: SessionHandle, pkt: Packet) {
		if decode_body::<LogoutRequest>(&pkt.body).is_err() {
			let resp = LogoutResponse {
				code: ErrorCode::InvalidParam as i32,
				server_time: unix_ms_now(),
			};
			send_packet(&session, MsgId::LogoutResp, pkt.sequence, &resp);
			return;
		}

		self.state.lock().await.remove_session(&session);

		let resp = LogoutResponse {
			code: ErrorCode::Ok as i32,
			server_time: unix_ms_now(),
		};
		send_packet(&session, MsgId::LogoutResp, pkt.sequence, &resp);
	}

	async fn handle_send_message(&self, session: SessionHandle, pkt: Packet) {
		let invalid = |session: &SessionHandle| {
			let resp = SendMessageResponse {
				code: ErrorCode::InvalidParam as i32,
				server_timestamp: unix_ms_now(),
				..Default::default()
			};
			send_packet(session, MsgId::SendMessageResp, pkt.sequence, &resp);
		};

		let Ok(req) = decode_body::<SendMessageRequest>(&pkt.body) else {
			invalid(&session);
			return;
		};

		let is_private = req.channel_type == ChannelType::Private as i32;
		if req.sender_id.is_empty()
			|| (is_private && req.receiver_id.is_empty())
			|| (!is_private && req.channel_id.is_empty())
		{
			invalid(&session);
			return;
		}

		let msg = ChatMessage {
			message_id: generate_message_id(),
			sender_id: req.sender_id.clone(),
			receiver_id: req.receiver_id.clone(),
			channel_type: req.channel_type,
			channel_id: if is_private {
				private_channel_id(&req.sender_id, &req.receiver_id)
			} else {
				req.channel_id.clone()
			},
			msg_type: req.msg_type,
			content: req.content,
			timestamp: unix_ms_now(),
			client_timestamp: req.client_timestamp,
		};

		self.store.lock().await.add_message(msg.clone());
		metrics::counter!("chirp_chat_messages_total").increment(1);

		let resp = SendMessageResponse {
			code: ErrorCode::Ok as i32,
			message_id: msg.message_id.clone(),
			server_timestamp: msg.timestamp,
		};
		send_packet(&session, MsgId::SendMessageResp, pkt.sequence, &resp);

		// Group channels are stored only; no fan-out path.
		if is_private {
			let recipient = self.state.lock().await.session_for_user(&req.receiver_id);
			if let Some(recipient) = recipient {
				metrics::counter!("chirp_chat_notifies_total").increment(1);
				send_packet(&recipient, MsgId::ChatMessageNotify, 0, &msg);
			}
		}
	}

	async fn handle_get_history(&self, session: SessionHandle, pkt: Packet) {
		let invalid = |session: &SessionHandle| {
			let resp = GetHistoryResponse {
				code: ErrorCode::InvalidParam as i32,
				has_more: false,
				messages: Vec::new(),
			};
			send_packet(session, MsgId::GetHistoryResp, pkt.sequence, &resp);
		};

		let Ok(req) = decode_body::<GetHistoryRequest>(&pkt.body) else {
			invalid(&session);
			return;
		};
		if req.channel_id.is_empty() {
			invalid(&session);
			return;
		}

		let (messages, has_more) =
			self.store
				.lock()
				.await
				.get_history(req.channel_type, &req.channel_id, req.before_timestamp, req.limit);

		let resp = GetHistoryResponse {
			code: ErrorCode::Ok as i32,
			messages,
			has_more,
		};
		send_packet(&session, MsgId::GetHistoryResp, pkt.sequence, &resp);
	}
}

#[async_trait::async_trait]
impl SessionHandler for ChatDispatcher {
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
			MsgId::SendMessageReq => self.handle_send_message(session, pkt).await,
			MsgId::GetHistoryReq => self.handle_get_history(session, pkt).await,
			_ => {}
		}
	}

	async fn on_close(&self, session: SessionHandle) {
		self.state.lock().await.remove_session(&session);
	}
}
