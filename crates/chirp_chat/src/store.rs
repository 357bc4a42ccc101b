#![forbid(unsafe_code)]

//! In-memory per-channel message history, bounded to the newest entries.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chirp_common::time::unix_ms_now;
use chirp_protocol::pb::{ChannelType, ChatMessage};

/// Retained messages per channel; older entries are evicted.
pub const HISTORY_CAPACITY: usize = 100;

/// Default page size when a request passes `limit <= 0`.
pub const DEFAULT_HISTORY_LIMIT: i32 = 50;

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// `"msg_" + server_ms + "_" + process-monotonic counter`.
pub fn generate_message_id() -> String {
	let n = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
	format!("msg_{}_{}", unix_ms_now(), n)
}

/// Primary key into the history map.
pub fn channel_key(channel_type: i32, channel_id: &str) -> String {
	format!("{channel_type}:{channel_id}")
}

/// Direction-independent id for a private conversation.
pub fn private_channel_id(a: &str, b: &str) -> String {
	if a <= b { format!("{a}|{b}") } else { format!("{b}|{a}") }
}

#[derive(Debug, Default)]
pub struct MessageStore {
	history: HashMap<String, VecDeque<ChatMessage>>,
}

impl MessageStore {
	pub fn add_message(&mut self, msg: ChatMessage) {
		let key = channel_key(msg.channel_type, &msg.channel_id);
		let msgs = self.history.entry(key).or_default();
		msgs.push_back(msg);

		while msgs.len() > HISTORY_CAPACITY {
			msgs.pop_front();
		}
	}

	/// Messages strictly older than `before_timestamp`, newest-first walk,
	/// returned oldest-first; `has_more` marks a page cut short by `limit`.
	///
	/// `before_timestamp <= 0` means "include the newest" (now + 1);
	/// `limit <= 0` falls back to [`DEFAULT_HISTORY_LIMIT`].
	pub fn get_history(
		&self,
		channel_type: i32,
		channel_id: &str,
		before_timestamp: i64,
		limit: i32,
	) -> (Vec<ChatMessage>, bool) {
		let Some(msgs) = self.history.get(&channel_key(channel_type, channel_id)) else {
			return (Vec::new(), false);
		};

		let before = if before_timestamp <= 0 {
			unix_ms_now() + 1
		} else {
			before_timestamp
		};
		let limit = if limit <= 0 { DEFAULT_HISTORY_LIMIT } else { limit } as usize;

		let mut result = Vec::new();
		let mut has_more = false;
		let mut older = msgs.iter().rev().filter(|m| m.timestamp < before);
		for msg in older.by_ref() {
			result.push(msg.clone());
			if result.len() >= limit {
				has_more = older.next().is_some();
				break;
			}
		}

		result.reverse();
		(result, has_more)
	}

	pub fn channel_len(&self, channel_type: i32, channel_id: &str) -> usize {
		self.history
			.get(&channel_key(channel_type, channel_id))
			.map_or(0, VecDeque::len)
	}
}
