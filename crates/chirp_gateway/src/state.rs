#![forbid(unsafe_code)]

//! Local user↔session ownership maps, guarded by one mutex at the call site.

use std::collections::HashMap;

use chirp_net::{SessionHandle, WeakSessionHandle};

#[derive(Debug, Clone)]
struct BoundUser {
	user_id: String,
	session_id: String,
}

/// At most one live session per user on this instance.
///
/// The forward map holds weak handles: session lifetime belongs to the
/// transport, never to this registry.
#[derive(Debug, Default)]
pub struct GatewayState {
	user_to_session: HashMap<String, WeakSessionHandle>,
	session_to_user: HashMap<u64, BoundUser>,
}

impl GatewayState {
	/// Point `user_id` at `session`, returning the previous live session
	/// (if any, and not `session` itself) so the caller can kick it.
	pub fn bind_user(&mut self, session: &SessionHandle, user_id: &str, session_id: &str) -> Option<SessionHandle> {
		let old = self.user_to_session.get(user_id).and_then(WeakSessionHandle::upgrade);

		self.user_to_session.insert(user_id.to_string(), session.downgrade());
		self.session_to_user.insert(
			session.id(),
			BoundUser {
				user_id: user_id.to_string(),
				session_id: session_id.to_string(),
			},
		);

		old.filter(|o| o.id() != session.id())
	}

	/// `(user_id, session_id)` bound to this session, if any.
	pub fn bound_user(&self, session: &SessionHandle) -> Option<(String, String)> {
		self.session_to_user
			.get(&session.id())
			.map(|b| (b.user_id.clone(), b.session_id.clone()))
	}

	/// Drop this session's binding. The forward entry is erased only while
	/// it still points at this session (a newer login may have taken over);
	/// returns the user id when it was erased, meaning the caller should
	/// release the global lease.
	pub fn remove_session(&mut self, session: &SessionHandle) -> Option<String> {
		let bound = self.session_to_user.remove(&session.id())?;

		let erase = match self.user_to_session.get(&bound.user_id) {
			Some(weak) => match weak.upgrade() {
				None => true,
				Some(cur) => cur.id() == session.id(),
			},
			None => return None,
		};

		if erase {
			self.user_to_session.remove(&bound.user_id);
			Some(bound.user_id)
		} else {
			None
		}
	}

	pub fn session_for_user(&self, user_id: &str) -> Option<SessionHandle> {
		self.user_to_session.get(user_id)?.upgrade()
	}

	pub fn user_count(&self) -> usize {
		self.user_to_session.len()
	}
}
