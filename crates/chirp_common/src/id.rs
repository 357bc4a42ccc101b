#![forbid(unsafe_code)]

use rand::Rng;

/// Random lowercase hex string covering `bytes` random bytes.
pub fn random_hex(bytes: usize) -> String {
	let mut rng = rand::rng();
	let mut out = String::with_capacity(bytes * 2);
	for _ in 0..bytes {
		let b: u8 = rng.random();
		out.push_str(&format!("{b:02x}"));
	}
	out
}
