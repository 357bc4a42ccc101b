#![forbid(unsafe_code)]

//! Redis-backed global session leases plus cross-instance kick delivery.
//!
//! One serial worker thread consumes claim/release jobs in FIFO order; the
//! subscriber thread listens on this instance's kick channel and forwards
//! user ids to the gateway's reactor. Redis failures are logged and the
//! claim completes with "no previous owner" so logins still succeed.

use std::sync::mpsc;
use std::thread::JoinHandle;

use chirp_common::redis::{RedisClient, RedisSubscriber};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, warn};

pub fn session_key(user_id: &str) -> String {
	format!("chirp:sess:{user_id}")
}

pub fn kick_channel(instance_id: &str) -> String {
	format!("chirp:kick:{instance_id}")
}

enum Job {
	Claim {
		user_id: String,
		reply: oneshot::Sender<Option<String>>,
	},
	Release {
		user_id: String,
	},
}

pub struct RedisSessionManager {
	instance_id: String,
	tx: Option<mpsc::Sender<Job>>,
	worker: Option<JoinHandle<()>>,
	subscriber: RedisSubscriber,
}

impl RedisSessionManager {
	/// Start the worker and the kick subscriber. Incoming kick payloads
	/// (plain user ids) are forwarded on `kick_tx`.
	pub fn start(
		host: impl Into<String>,
		port: u16,
		instance_id: impl Into<String>,
		ttl_seconds: i64,
		kick_tx: tokio_mpsc::UnboundedSender<String>,
	) -> Self {
		let host = host.into();
		let instance_id = instance_id.into();

		let subscriber = RedisSubscriber::start(host.clone(), port, kick_channel(&instance_id), move |_channel, payload| {
			let _ = kick_tx.send(payload.to_string());
		});

		let (tx, rx) = mpsc::channel::<Job>();
		let worker = {
			let client = RedisClient::new(host, port);
			let instance_id = instance_id.clone();
			std::thread::spawn(move || run_worker(&client, &instance_id, ttl_seconds, rx))
		};

		Self {
			instance_id,
			tx: Some(tx),
			worker: Some(worker),
			subscriber,
		}
	}

	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}

	/// Claim the global lease for `user_id`; resolves with the previous
	/// owner's instance id, if the lease already existed.
	pub fn claim(&self, user_id: &str) -> oneshot::Receiver<Option<String>> {
		let (reply, rx) = oneshot::channel();
		if let Some(tx) = &self.tx {
			let _ = tx.send(Job::Claim {
				user_id: user_id.to_string(),
				reply,
			});
		}
		rx
	}

	/// Release the lease if this instance still owns it.
	pub fn release(&self, user_id: &str) {
		if let Some(tx) = &self.tx {
			let _ = tx.send(Job::Release {
				user_id: user_id.to_string(),
			});
		}
	}

	pub fn stop(&mut self) {
		self.tx.take();
		if let Some(worker) = self.worker.take() {
			let _ = worker.join();
		}
		self.subscriber.stop();
	}
}

impl Drop for RedisSessionManager {
	fn drop(&mut self) {
		self.stop();
	}
}

fn run_worker(client: &RedisClient, instance_id: &str, ttl_seconds: i64, rx: mpsc::Receiver<Job>) {
	for job in rx {
		match job {
			Job::Claim { user_id, reply } => {
				let prev = match claim_lease(client, instance_id, ttl_seconds, &user_id) {
					Ok(prev) => prev,
					Err(e) => {
						warn!(error = %e, user = %user_id, "redis claim failed");
						metrics::counter!("chirp_gateway_redis_failures_total").increment(1);
						None
					}
				};
				let _ = reply.send(prev);
			}
			Job::Release { user_id } => {
				if let Err(e) = release_lease(client, instance_id, &user_id) {
					warn!(error = %e, user = %user_id, "redis release failed");
					metrics::counter!("chirp_gateway_redis_failures_total").increment(1);
				}
			}
		}
	}
}

/// Kick the previous owner (publish before SET, so the old instance hears
/// about the takeover before the new login is acknowledged), then write the
/// lease.
fn claim_lease(
	client: &RedisClient,
	instance_id: &str,
	ttl_seconds: i64,
	user_id: &str,
) -> Result<Option<String>, chirp_common::redis::RedisError> {
	let key = session_key(user_id);
	let prev = client.get(&key)?;

	if let Some(prev_owner) = prev.as_deref()
		&& prev_owner != instance_id
	{
		client.publish(&kick_channel(prev_owner), user_id)?;
		debug!(user = %user_id, prev = %prev_owner, "published cross-instance kick");
	}

	client.set_ex(&key, instance_id, ttl_seconds)?;
	Ok(prev)
}

/// Never delete another instance's lease: a slow claim racing a fast
/// reconnect elsewhere must not clobber the new owner.
fn release_lease(client: &RedisClient, instance_id: &str, user_id: &str) -> Result<(), chirp_common::redis::RedisError> {
	let key = session_key(user_id);
	if client.get(&key)?.as_deref() == Some(instance_id) {
		client.del(&key)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_and_channel_shapes() {
		assert_eq!(session_key("u1"), "chirp:sess:u1");
		assert_eq!(kick_channel("inst-A"), "chirp:kick:inst-A");
	}
}
