#![forbid(unsafe_code)]

//! HS256 JWT mint/verify for login tokens.

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
	alg: String,
	typ: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
	pub sub: String,
	#[serde(default)]
	pub iat: i64,
}

/// True when the token is shaped like a JWT (two `.` separators).
pub fn looks_like_jwt(token: &str) -> bool {
	let mut dots = token.split('.');
	dots.next().is_some() && dots.next().is_some() && dots.next().is_some()
}

/// Mint a `{"sub":…,"iat":…}` token signed with HS256.
pub fn sign_hs256(subject: &str, issued_at: i64, secret: &str) -> anyhow::Result<String> {
	let header = serde_json::to_vec(&Header {
		alg: "HS256".to_string(),
		typ: "JWT".to_string(),
	})
	.context("serialize jwt header")?;
	let claims = serde_json::to_vec(&JwtClaims {
		sub: subject.to_string(),
		iat: issued_at,
	})
	.context("serialize jwt claims")?;

	let signing_input = format!("{}.{}", URL_SAFE_NO_PAD.encode(header), URL_SAFE_NO_PAD.encode(claims));
	let sig = sign(signing_input.as_bytes(), secret.as_bytes());
	Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

/// Verify an HS256 token and return its claims.
///
/// Rejects any `alg` other than HS256; trailing `=` padding on the presented
/// signature is tolerated. The signature compare is constant-time.
pub fn verify_hs256(token: &str, secret: &str) -> anyhow::Result<JwtClaims> {
	let mut parts = token.split('.');
	let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) =
		(parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(anyhow!("invalid token format"));
	};

	let signing_input = format!("{header_b64}.{payload_b64}");
	let expected = URL_SAFE_NO_PAD.encode(sign(signing_input.as_bytes(), secret.as_bytes()));
	let provided = sig_b64.trim_end_matches('=');
	if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
		return Err(anyhow!("invalid token signature"));
	}

	let header_json = URL_SAFE_NO_PAD.decode(header_b64).context("decode token header")?;
	let header: Header = serde_json::from_slice(&header_json).context("parse token header")?;
	if header.alg != "HS256" {
		return Err(anyhow!("unsupported alg: {}", header.alg));
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let claims: JwtClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	Ok(claims)
}

fn sign(signing_input: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(signing_input);
	mac.finalize().into_bytes().to_vec()
}

/// Byte-wise constant-time equality.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
