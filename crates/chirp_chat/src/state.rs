#![forbid(unsafe_code)]

//! Chat-side user↔session registry (no auth session ids here).

use std::collections::HashMap;

use chirp_net::{SessionHandle, WeakSessionHandle};

#[derive(Debug, Default)]
pub struct ChatState {
	user_to_session: HashMap<String, WeakSessionHandle>,
	session_to_user: HashMap<u64, String>,
}

impl ChatState {
	/// Point `user_id` at `session`; returns the displaced live session.
	pub fn bind_user(&mut self, session: &SessionHandle, user_id: &str) -> Option<SessionHandle> {
		let old = self.user_to_session.get(user_id).and_then(WeakSessionHandle::upgrade);

		self.user_to_session.insert(user_id.to_string(), session.downgrade());
		self.session_to_user.insert(session.id(), user_id.to_string());

		old.filter(|o| o.id() != session.id())
	}

	/// Remove this session's binding; the forward entry is left alone when a
	/// newer session has already taken the user over.
	pub fn remove_session(&mut self, session: &SessionHandle) {
		let Some(user_id) = self.session_to_user.remove(&session.id()) else {
			return;
		};

		if let Some(weak) = self.user_to_session.get(&user_id) {
			let cur = weak.upgrade();
			if cur.is_none() || cur.is_some_and(|c| c.id() == session.id()) {
				self.user_to_session.remove(&user_id);
			}
		}
	}

	pub fn session_for_user(&self, user_id: &str) -> Option<SessionHandle> {
		self.user_to_session.get(user_id)?.upgrade()
	}

	pub fn user_count(&self) -> usize {
		self.user_to_session.len()
	}
}

#[cfg(test)]
mod tests {
	use chirp_net::{SessionHandle, TransportKind};

	use super::*;

	#[test]
	fn close_after_takeover_keeps_new_binding() {
		let mut state = ChatState::default();
		let (s1, _sink1) = SessionHandle::in_memory(TransportKind::Tcp);
		let (s2, _sink2) = SessionHandle::in_memory(TransportKind::Tcp);

		assert!(state.bind_user(&s1, "u").is_none());
		assert_eq!(state.bind_user(&s2, "u").map(|s| s.id()), Some(s1.id()));

		state.remove_session(&s1);
		assert_eq!(state.session_for_user("u").map(|s| s.id()), Some(s2.id()));

		state.remove_session(&s2);
		assert!(state.session_for_user("u").is_none());
		assert_eq!(state.user_count(), 0);
	}
}
