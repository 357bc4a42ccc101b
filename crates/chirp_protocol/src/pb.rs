#![forbid(unsafe_code)]

//! Wire messages (`chirp.v1`).
//!
//! Hand-declared prost structs; every service and the SDK share this schema
//! so request/response pairing by `sequence` works uniformly.

/// Message kinds carried in [`Packet::msg_id`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgId {
	Unknown = 0,
	LoginReq = 1,
	LoginResp = 2,
	LogoutReq = 3,
	LogoutResp = 4,
	HeartbeatPing = 5,
	HeartbeatPong = 6,
	SendMessageReq = 7,
	SendMessageResp = 8,
	GetHistoryReq = 9,
	GetHistoryResp = 10,
	ChatMessageNotify = 11,
	KickNotify = 12,
}

/// Response status carried in every `*Resp` body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
	Ok = 0,
	InvalidParam = 1,
	AuthFailed = 2,
	SessionExpired = 3,
	InternalError = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ChannelType {
	Private = 0,
	Group = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgType {
	Text = 0,
	Image = 1,
}

/// The packet envelope framed by the 4-byte length prefix.
///
/// `sequence` is chosen by the requester and echoed on the paired response;
/// unsolicited pushes carry sequence 0.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
	#[prost(enumeration = "MsgId", tag = "1")]
	pub msg_id: i32,
	#[prost(int64, tag = "2")]
	pub sequence: i64,
	#[prost(bytes = "vec", tag = "3")]
	pub body: Vec<u8>,
}

impl Packet {
	/// Decoded message kind; unrecognized values map to [`MsgId::Unknown`].
	pub fn kind(&self) -> MsgId {
		MsgId::try_from(self.msg_id).unwrap_or(MsgId::Unknown)
	}
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginRequest {
	#[prost(string, tag = "1")]
	pub token: String,
	#[prost(string, tag = "2")]
	pub device_id: String,
	#[prost(string, tag = "3")]
	pub platform: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoginResponse {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub user_id: String,
	#[prost(string, tag = "3")]
	pub session_id: String,
	#[prost(int64, tag = "4")]
	pub server_time: i64,
	#[prost(bool, tag = "5")]
	pub kick_previous: bool,
	#[prost(message, optional, tag = "6")]
	pub kick: Option<KickNotify>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogoutRequest {
	#[prost(string, tag = "1")]
	pub user_id: String,
	#[prost(string, tag = "2")]
	pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogoutResponse {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(int64, tag = "2")]
	pub server_time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KickNotify {
	#[prost(string, tag = "1")]
	pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatPing {
	#[prost(int64, tag = "1")]
	pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatPong {
	#[prost(int64, tag = "1")]
	pub timestamp: i64,
	#[prost(int64, tag = "2")]
	pub server_time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageRequest {
	#[prost(string, tag = "1")]
	pub sender_id: String,
	#[prost(string, tag = "2")]
	pub receiver_id: String,
	#[prost(enumeration = "ChannelType", tag = "3")]
	pub channel_type: i32,
	#[prost(string, tag = "4")]
	pub channel_id: String,
	#[prost(enumeration = "MsgType", tag = "5")]
	pub msg_type: i32,
	#[prost(string, tag = "6")]
	pub content: String,
	#[prost(int64, tag = "7")]
	pub client_timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageResponse {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(string, tag = "2")]
	pub message_id: String,
	#[prost(int64, tag = "3")]
	pub server_timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHistoryRequest {
	#[prost(enumeration = "ChannelType", tag = "1")]
	pub channel_type: i32,
	#[prost(string, tag = "2")]
	pub channel_id: String,
	#[prost(int64, tag = "3")]
	pub before_timestamp: i64,
	#[prost(int32, tag = "4")]
	pub limit: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetHistoryResponse {
	#[prost(enumeration = "ErrorCode", tag = "1")]
	pub code: i32,
	#[prost(message, repeated, tag = "2")]
	pub messages: Vec<ChatMessage>,
	#[prost(bool, tag = "3")]
	pub has_more: bool,
}

/// A stored/pushed chat message. `timestamp` is server-assigned.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
	#[prost(string, tag = "1")]
	pub message_id: String,
	#[prost(string, tag = "2")]
	pub sender_id: String,
	#[prost(string, tag = "3")]
	pub receiver_id: String,
	#[prost(enumeration = "ChannelType", tag = "4")]
	pub channel_type: i32,
	#[prost(string, tag = "5")]
	pub channel_id: String,
	#[prost(enumeration = "MsgType", tag = "6")]
	pub msg_type: i32,
	#[prost(string, tag = "7")]
	pub content: String,
	#[prost(int64, tag = "8")]
	pub timestamp: i64,
	#[prost(int64, tag = "9")]
	pub client_timestamp: i64,
}
