#![forbid(unsafe_code)]

//! Chat dispatcher flows driven through in-memory sessions.

use chirp_chat::dispatcher::ChatDispatcher;
use chirp_net::{SessionHandle, SessionHandler, SessionSink, TransportKind};
use chirp_protocol::pb::{
	ChannelType, ChatMessage, ErrorCode, GetHistoryRequest, GetHistoryResponse, KickNotify, LoginRequest,
	LoginResponse, MsgId, MsgType, Packet, SendMessageRequest, SendMessageResponse,
};
use chirp_protocol::{FrameBuffer, decode_body};
use prost::Message;

fn envelope<M: Message>(msg_id: MsgId, sequence: i64, body: &M) -> Vec<u8> {
	Packet {
		msg_id: msg_id as i32,
		sequence,
		body: body.encode_to_vec(),
	}
	.encode_to_vec()
}

/// Pop one framed packet out of an in-memory session sink.
fn next_packet(sink: &mut SessionSink) -> (Packet, bool) {
	let (bytes, close_after) = sink.try_next().expect("expected an outbound frame");
	let mut framer = FrameBuffer::new();
	framer.append(&bytes);
	let payload = framer.pop_frame().expect("whole frame");
	assert_eq!(framer.buffered(), 0);
	(decode_body(&payload).expect("decode packet"), close_after)
}

fn assert_no_packet(sink: &mut SessionSink) {
	assert!(sink.try_next().is_none(), "unexpected outbound frame");
}

async fn login(dispatcher: &ChatDispatcher, session: &SessionHandle, sink: &mut SessionSink, seq: i64, user: &str) {
	let req = LoginRequest {
		token: user.to_string(),
		device_id: "test".to_string(),
		platform: "test".to_string(),
	};
	dispatcher.on_frame(session.clone(), envelope(MsgId::LoginReq, seq, &req)).await;

	let (pkt, close_after) = next_packet(sink);
	assert_eq!(pkt.kind(), MsgId::LoginResp);
	assert_eq!(pkt.sequence, seq);
	assert!(!close_after);
	let resp: LoginResponse = decode_body(&pkt.body).expect("decode login resp");
	assert_eq!(resp.code, ErrorCode::Ok as i32);
	assert_eq!(resp.user_id, user);
}

fn private_send(sender: &str, receiver: &str, content: &str) -> SendMessageRequest {
	SendMessageRequest {
		sender_id: sender.to_string(),
		receiver_id: receiver.to_string(),
		channel_type: ChannelType::Private as i32,
		channel_id: String::new(),
		msg_type: MsgType::Text as i32,
		content: content.to_string(),
		client_timestamp: 42,
	}
}

#[tokio::test]
async fn private_message_reaches_online_recipient() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	let (sb, mut sink_b) = SessionHandle::in_memory(TransportKind::Tcp);

	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;
	login(&dispatcher, &sb, &mut sink_b, 1, "b").await;

	dispatcher
		.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 2, &private_send("a", "b", "hi")))
		.await;

	let (pkt, _) = next_packet(&mut sink_a);
	assert_eq!(pkt.kind(), MsgId::SendMessageResp);
	assert_eq!(pkt.sequence, 2);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode send resp");
	assert_eq!(resp.code, ErrorCode::Ok as i32);
	assert!(resp.message_id.starts_with("msg_"));
	assert!(resp.server_timestamp > 0);

	// Online recipient gets the push with sequence 0.
	let (notify, close_after) = next_packet(&mut sink_b);
	assert_eq!(notify.kind(), MsgId::ChatMessageNotify);
	assert_eq!(notify.sequence, 0);
	assert!(!close_after);
	let msg: ChatMessage = decode_body(&notify.body).expect("decode chat message");
	assert_eq!(msg.message_id, resp.message_id);
	assert_eq!(msg.sender_id, "a");
	assert_eq!(msg.receiver_id, "b");
	assert_eq!(msg.channel_id, "a|b");
	assert_eq!(msg.content, "hi");
	assert_eq!(msg.timestamp, resp.server_timestamp);
	assert_eq!(msg.client_timestamp, 42);
}

#[tokio::test]
async fn offline_recipient_gets_history_entry_only() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;

	dispatcher
		.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 2, &private_send("a", "b", "offline msg")))
		.await;

	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode send resp");
	assert_eq!(resp.code, ErrorCode::Ok as i32);

	// History for the derived channel holds the message.
	let req = GetHistoryRequest {
		channel_type: ChannelType::Private as i32,
		channel_id: "a|b".to_string(),
		before_timestamp: 0,
		limit: 10,
	};
	dispatcher.on_frame(sa.clone(), envelope(MsgId::GetHistoryReq, 3, &req)).await;

	let (pkt, _) = next_packet(&mut sink_a);
	assert_eq!(pkt.kind(), MsgId::GetHistoryResp);
	let hist: GetHistoryResponse = decode_body(&pkt.body).expect("decode history");
	assert_eq!(hist.code, ErrorCode::Ok as i32);
	assert_eq!(hist.messages.len(), 1);
	assert_eq!(hist.messages[0].content, "offline msg");
	assert!(!hist.has_more);
}

#[tokio::test]
async fn send_validation_rejects_missing_fields() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;

	// Empty sender.
	let mut req = private_send("", "b", "x");
	dispatcher.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 2, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(resp.code, ErrorCode::InvalidParam as i32);

	// Private with empty receiver.
	req = private_send("a", "", "x");
	dispatcher.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 3, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(resp.code, ErrorCode::InvalidParam as i32);

	// Group with empty channel id.
	req = private_send("a", "", "x");
	req.channel_type = ChannelType::Group as i32;
	dispatcher.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 4, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(resp.code, ErrorCode::InvalidParam as i32);
}

#[tokio::test]
async fn group_messages_are_stored_but_never_pushed() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	let (sb, mut sink_b) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;
	login(&dispatcher, &sb, &mut sink_b, 1, "b").await;

	let mut req = private_send("a", "b", "group hello");
	req.channel_type = ChannelType::Group as i32;
	req.channel_id = "g1".to_string();
	dispatcher.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 2, &req)).await;

	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(resp.code, ErrorCode::Ok as i32);
	assert_no_packet(&mut sink_b);

	let hreq = GetHistoryRequest {
		channel_type: ChannelType::Group as i32,
		channel_id: "g1".to_string(),
		before_timestamp: 0,
		limit: 10,
	};
	dispatcher.on_frame(sa.clone(), envelope(MsgId::GetHistoryReq, 3, &hreq)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let hist: GetHistoryResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(hist.messages.len(), 1);
	assert_eq!(hist.messages[0].channel_id, "g1");
}

#[tokio::test]
async fn relogin_kicks_previous_chat_session() {
	let dispatcher = ChatDispatcher::new();
	let (s1, mut sink1) = SessionHandle::in_memory(TransportKind::Tcp);
	let (s2, mut sink2) = SessionHandle::in_memory(TransportKind::Tcp);

	login(&dispatcher, &s1, &mut sink1, 1, "u").await;
	login(&dispatcher, &s2, &mut sink2, 1, "u").await;

	let (kick_pkt, close_after) = next_packet(&mut sink1);
	assert_eq!(kick_pkt.kind(), MsgId::KickNotify);
	assert_eq!(kick_pkt.sequence, 0);
	assert!(close_after, "kick should close after flushing");
	let kick: KickNotify = decode_body(&kick_pkt.body).expect("decode kick");
	assert_eq!(kick.reason, "login from another device");
}

#[tokio::test]
async fn history_respects_before_timestamp_paging() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;

	for i in 0..5 {
		dispatcher
			.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 10 + i, &private_send("a", "b", &format!("m{i}"))))
			.await;
		let (pkt, _) = next_packet(&mut sink_a);
		let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
		assert_eq!(resp.code, ErrorCode::Ok as i32);
	}

	// Page of two: newest two, ascending, with more behind.
	let req = GetHistoryRequest {
		channel_type: ChannelType::Private as i32,
		channel_id: "a|b".to_string(),
		before_timestamp: 0,
		limit: 2,
	};
	dispatcher.on_frame(sa.clone(), envelope(MsgId::GetHistoryReq, 20, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let hist: GetHistoryResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(hist.messages.len(), 2);
	assert!(hist.has_more);
	assert_eq!(hist.messages[0].content, "m3");
	assert_eq!(hist.messages[1].content, "m4");

	// Everything strictly older than the oldest of that page.
	let req = GetHistoryRequest {
		channel_type: ChannelType::Private as i32,
		channel_id: "a|b".to_string(),
		before_timestamp: hist.messages[0].timestamp,
		limit: 50,
	};
	dispatcher.on_frame(sa.clone(), envelope(MsgId::GetHistoryReq, 21, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let older: GetHistoryResponse = decode_body(&pkt.body).expect("decode");
	assert!(older.messages.iter().all(|m| m.timestamp < hist.messages[0].timestamp));
	assert!(older.messages.iter().all(|m| m.content != "m3" && m.content != "m4"));
}

#[tokio::test]
async fn missing_channel_id_in_history_request_is_invalid() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;

	let req = GetHistoryRequest {
		channel_type: ChannelType::Private as i32,
		channel_id: String::new(),
		before_timestamp: 0,
		limit: 10,
	};
	dispatcher.on_frame(sa.clone(), envelope(MsgId::GetHistoryReq, 2, &req)).await;
	let (pkt, _) = next_packet(&mut sink_a);
	let hist: GetHistoryResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(hist.code, ErrorCode::InvalidParam as i32);
}

#[tokio::test]
async fn closed_recipient_session_is_not_pushed_to() {
	let dispatcher = ChatDispatcher::new();
	let (sa, mut sink_a) = SessionHandle::in_memory(TransportKind::Tcp);
	let (sb, mut sink_b) = SessionHandle::in_memory(TransportKind::Tcp);
	login(&dispatcher, &sa, &mut sink_a, 1, "a").await;
	login(&dispatcher, &sb, &mut sink_b, 1, "b").await;

	// b's transport goes away.
	dispatcher.on_close(sb.clone()).await;

	dispatcher
		.on_frame(sa.clone(), envelope(MsgId::SendMessageReq, 2, &private_send("a", "b", "late")))
		.await;
	let (pkt, _) = next_packet(&mut sink_a);
	let resp: SendMessageResponse = decode_body(&pkt.body).expect("decode");
	assert_eq!(resp.code, ErrorCode::Ok as i32);
	assert_no_packet(&mut sink_b);
}
