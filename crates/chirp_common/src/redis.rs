#![forbid(unsafe_code)]

//! Minimal RESP2 plumbing: command encoding, a streaming reply parser, a
//! synchronous one-shot command client, and a pub/sub subscriber thread.
//!
//! Callers run these from worker threads; nothing here is async.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RedisError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("connection closed before a full reply arrived")]
	ConnectionClosed,
}

/// One parsed RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
	Simple(String),
	Error(String),
	Integer(i64),
	Bulk(String),
	Null,
	Array(Vec<RespValue>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
	let mut out = Vec::with_capacity(64);
	out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
	for a in args {
		out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
		out.extend_from_slice(a.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out
}

/// Streaming RESP2 reply parser.
///
/// `pop` returns `None` until a whole top-level value is buffered, then
/// removes exactly that value's bytes.
#[derive(Debug, Default)]
pub struct RespParser {
	buf: Vec<u8>,
}

impl RespParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn append(&mut self, data: &[u8]) {
		self.buf.extend_from_slice(data);
	}

	pub fn pop(&mut self) -> Option<RespValue> {
		let (value, consumed) = self.parse_at(0)?;
		self.buf.drain(..consumed);
		Some(value)
	}

	/// Line starting at `off` up to CRLF; returns (line, offset past CRLF).
	fn read_line(&self, off: usize) -> Option<(&[u8], usize)> {
		let rel = self.buf[off..].windows(2).position(|w| w == b"\r\n")?;
		Some((&self.buf[off..off + rel], off + rel + 2))
	}

	fn parse_at(&self, off: usize) -> Option<(RespValue, usize)> {
		let tag = *self.buf.get(off)?;
		match tag {
			b'+' | b'-' | b':' => {
				let (line, next) = self.read_line(off + 1)?;
				let text = String::from_utf8_lossy(line).into_owned();
				let value = match tag {
					b'+' => RespValue::Simple(text),
					b'-' => RespValue::Error(text),
					_ => RespValue::Integer(text.parse().unwrap_or(0)),
				};
				Some((value, next))
			}
			b'$' => {
				let (line, next) = self.read_line(off + 1)?;
				let n: i64 = String::from_utf8_lossy(line).parse().unwrap_or(-1);
				if n < 0 {
					return Some((RespValue::Null, next));
				}
				let need = next + n as usize + 2;
				if self.buf.len() < need {
					return None;
				}
				let data = String::from_utf8_lossy(&self.buf[next..next + n as usize]).into_owned();
				Some((RespValue::Bulk(data), need))
			}
			b'*' => {
				let (line, next) = self.read_line(off + 1)?;
				let n: i64 = String::from_utf8_lossy(line).parse().unwrap_or(-1);
				if n < 0 {
					return Some((RespValue::Null, next));
				}
				let mut items = Vec::with_capacity(n as usize);
				let mut cur = next;
				for _ in 0..n {
					let (child, child_end) = self.parse_at(cur)?;
					items.push(child);
					cur = child_end;
				}
				Some((RespValue::Array(items), cur))
			}
			_ => None,
		}
	}
}

/// Synchronous command client: one connection per command, one reply.
#[derive(Debug, Clone)]
pub struct RedisClient {
	host: String,
	port: u16,
}

impl RedisClient {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self { host: host.into(), port }
	}

	fn send_command(&self, args: &[&str]) -> Result<RespValue, RedisError> {
		let mut stream = TcpStream::connect((self.host.as_str(), self.port))?;
		stream.write_all(&encode_command(args))?;

		let mut parser = RespParser::new();
		let mut buf = [0u8; 4096];
		loop {
			if let Some(v) = parser.pop() {
				return Ok(v);
			}
			let n = stream.read(&mut buf)?;
			if n == 0 {
				return Err(RedisError::ConnectionClosed);
			}
			parser.append(&buf[..n]);
		}
	}

	/// `GET key`; `None` for a null reply.
	pub fn get(&self, key: &str) -> Result<Option<String>, RedisError> {
		match self.send_command(&["GET", key])? {
			RespValue::Bulk(s) => Ok(Some(s)),
			_ => Ok(None),
		}
	}

	/// `SET key value EX ttl`; true iff the reply is `+OK`.
	pub fn set_ex(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool, RedisError> {
		let ttl = ttl_seconds.to_string();
		let reply = self.send_command(&["SET", key, value, "EX", &ttl])?;
		Ok(matches!(reply, RespValue::Simple(ref s) if s == "OK"))
	}

	/// `DEL key`; true iff the reply is an integer.
	pub fn del(&self, key: &str) -> Result<bool, RedisError> {
		Ok(matches!(self.send_command(&["DEL", key])?, RespValue::Integer(_)))
	}

	/// `PUBLISH channel message`; true iff the reply is an integer.
	pub fn publish(&self, channel: &str, message: &str) -> Result<bool, RedisError> {
		Ok(matches!(
			self.send_command(&["PUBLISH", channel, message])?,
			RespValue::Integer(_)
		))
	}
}

type MessageCallback = Box<dyn Fn(&str, &str) + Send>;

/// Dedicated subscriber thread for one pub/sub channel.
///
/// `stop` closes the socket out from under the blocking read and joins.
pub struct RedisSubscriber {
	stop: Arc<AtomicBool>,
	sock: Arc<Mutex<Option<TcpStream>>>,
	thread: Option<JoinHandle<()>>,
}

impl RedisSubscriber {
	pub fn start(
		host: impl Into<String>,
		port: u16,
		channel: impl Into<String>,
		cb: impl Fn(&str, &str) + Send + 'static,
	) -> Self {
		let host = host.into();
		let channel = channel.into();
		let stop = Arc::new(AtomicBool::new(false));
		let sock: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));

		let thread = {
			let stop = Arc::clone(&stop);
			let sock = Arc::clone(&sock);
			std::thread::spawn(move || {
				if let Err(e) = run_subscriber(&host, port, &channel, &stop, &sock, Box::new(cb)) {
					if !stop.load(Ordering::SeqCst) {
						warn!(error = %e, channel = %channel, "redis subscriber exited");
					}
				}
			})
		};

		Self {
			stop,
			sock,
			thread: Some(thread),
		}
	}

	pub fn stop(&mut self) {
		self.stop.store(true, Ordering::SeqCst);
		if let Ok(mut guard) = self.sock.lock()
			&& let Some(s) = guard.take()
		{
			let _ = s.shutdown(Shutdown::Both);
		}
		if let Some(t) = self.thread.take() {
			let _ = t.join();
		}
	}
}

impl Drop for RedisSubscriber {
	fn drop(&mut self) {
		self.stop();
	}
}

fn run_subscriber(
	host: &str,
	port: u16,
	channel: &str,
	stop: &AtomicBool,
	sock: &Mutex<Option<TcpStream>>,
	cb: MessageCallback,
) -> Result<(), RedisError> {
	let mut stream = TcpStream::connect((host, port))?;
	if let Ok(mut guard) = sock.lock() {
		*guard = Some(stream.try_clone()?);
	}

	stream.write_all(&encode_command(&["SUBSCRIBE", channel]))?;
	debug!(channel = %channel, "redis subscriber started");

	let mut parser = RespParser::new();
	let mut buf = [0u8; 4096];
	while !stop.load(Ordering::SeqCst) {
		let Some(value) = parser.pop() else {
			let n = stream.read(&mut buf)?;
			if n == 0 {
				return Err(RedisError::ConnectionClosed);
			}
			parser.append(&buf[..n]);
			continue;
		};

		let RespValue::Array(items) = value else { continue };
		if items.len() < 3 {
			continue;
		}
		let kind = match &items[0] {
			RespValue::Bulk(s) | RespValue::Simple(s) => s.as_str(),
			_ => continue,
		};
		if kind != "message" {
			continue;
		}
		let ch = match &items[1] {
			RespValue::Bulk(s) | RespValue::Simple(s) => s.as_str(),
			_ => continue,
		};
		if let RespValue::Bulk(payload) = &items[2] {
			cb(ch, payload);
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_commands_as_bulk_arrays() {
		let cmd = encode_command(&["SET", "k", "v", "EX", "60"]);
		assert_eq!(cmd, b"*5\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nEX\r\n$2\r\n60\r\n");
	}

	#[test]
	fn parses_scalar_replies() {
		let mut p = RespParser::new();
		p.append(b"+OK\r\n-ERR boom\r\n:42\r\n");
		assert_eq!(p.pop(), Some(RespValue::Simple("OK".to_string())));
		assert_eq!(p.pop(), Some(RespValue::Error("ERR boom".to_string())));
		assert_eq!(p.pop(), Some(RespValue::Integer(42)));
		assert_eq!(p.pop(), None);
	}

	#[test]
	fn parses_bulk_and_null() {
		let mut p = RespParser::new();
		p.append(b"$5\r\nhello\r\n$-1\r\n");
		assert_eq!(p.pop(), Some(RespValue::Bulk("hello".to_string())));
		assert_eq!(p.pop(), Some(RespValue::Null));
	}

	#[test]
	fn parses_nested_arrays_incrementally() {
		let wire = b"*3\r\n$7\r\nmessage\r\n$12\r\nchirp:kick:a\r\n$5\r\nuser1\r\n";
		for split in 0..wire.len() {
			let mut p = RespParser::new();
			p.append(&wire[..split]);
			assert_eq!(p.pop(), None, "split at {split}");
			p.append(&wire[split..]);
			let v = p.pop().expect("complete value");
			assert_eq!(
				v,
				RespValue::Array(vec![
					RespValue::Bulk("message".to_string()),
					RespValue::Bulk("chirp:kick:a".to_string()),
					RespValue::Bulk("user1".to_string()),
				])
			);
		}
	}

	#[test]
	fn null_array_parses_to_null() {
		let mut p = RespParser::new();
		p.append(b"*-1\r\n");
		assert_eq!(p.pop(), Some(RespValue::Null));
	}

	#[test]
	fn pop_consumes_exactly_one_value() {
		let mut p = RespParser::new();
		p.append(b":1\r\n:2\r\n");
		assert_eq!(p.pop(), Some(RespValue::Integer(1)));
		assert_eq!(p.pop(), Some(RespValue::Integer(2)));
		assert_eq!(p.pop(), None);
	}
}
