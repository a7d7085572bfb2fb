//! Constant-time HMAC verification for the `check-signature` rule node and
//! its Scalr-style cousin.

use crate::error::HookError;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

/// Freshness window for Scalr-style signing, in seconds.
pub const SCALR_FRESHNESS_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Some(Algorithm::Sha1),
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    pub fn default_prefix(&self) -> String {
        format!("{}=", self.name())
    }

}

/// Constant-time (byte-content-independent) ASCII comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn hmac_hex_sha1(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn hmac_hex_sha256(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn hmac_hex_sha512(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

impl Algorithm {
    fn digest_hex(&self, secret: &[u8], payload: &[u8]) -> String {
        match self {
            Algorithm::Sha1 => hmac_hex_sha1(secret, payload),
            Algorithm::Sha256 => hmac_hex_sha256(secret, payload),
            Algorithm::Sha512 => hmac_hex_sha512(secret, payload),
        }
    }
}

/// One candidate digest out of a (possibly comma-separated, possibly
/// `<alg>=<hex>` tagged) signature header.
fn candidate_hex<'a>(candidate: &'a str, prefix: &str) -> Option<&'a str> {
    let candidate = candidate.trim();
    if let Some(stripped) = candidate.strip_prefix(prefix) {
        Some(stripped)
    } else if !candidate.contains('=') {
        Some(candidate)
    } else {
        None
    }
}

/// Verifies `claimed_header` against an HMAC of `payload` under `secret`.
/// `claimed_header` may hold multiple comma-separated tagged or bare hex
/// digests; any one matching is sufficient.
pub fn verify(
    algorithm: Algorithm,
    secret: &[u8],
    payload: &[u8],
    prefix: &str,
    claimed_header: &str,
) -> Result<bool, HookError> {
    if claimed_header.trim().is_empty() {
        return Err(HookError::Signature("empty signature header".to_string()));
    }
    let expected = algorithm.digest_hex(secret, payload);
    let matched = claimed_header
        .split(',')
        .filter_map(|candidate| candidate_hex(candidate, prefix))
        .any(|hex| constant_time_eq(&expected, &hex.to_ascii_lowercase()));
    Ok(matched)
}

/// Scalr-style signing: HMAC-SHA1 of `body || date_header`, verified
/// against the `X-Signature` header, with a freshness window on `Date`.
pub fn verify_scalr(secret: &[u8], body: &[u8], date_header: &str, claimed_hex: &str) -> Result<bool, HookError> {
    let parsed = OffsetDateTime::parse(date_header, &Rfc2822)
        .map_err(|e| HookError::Signature(format!("malformed Date header: {e}")))?;
    let now = OffsetDateTime::now_utc();
    let age = (now - parsed).whole_seconds().abs();
    if age > SCALR_FRESHNESS_WINDOW_SECS {
        return Err(HookError::Signature("Date header outside freshness window".to_string()));
    }

    let mut message = Vec::with_capacity(body.len() + date_header.len());
    message.extend_from_slice(body);
    message.extend_from_slice(date_header.as_bytes());
    let expected = hmac_hex_sha1(secret, &message);
    Ok(constant_time_eq(&expected, &claimed_hex.trim().to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_signature_header_succeeds_if_any_candidate_matches() {
        let secret = b"topsecret";
        let payload = b"hello world";
        let good = hmac_hex_sha1(secret, payload);
        let header = format!("sha1={},sha1=deadbeef", good);
        assert!(verify(Algorithm::Sha1, secret, payload, "sha1=", &header).unwrap());
    }

    #[test]
    fn multi_signature_header_fails_if_all_candidates_wrong() {
        let secret = b"topsecret";
        let payload = b"hello world";
        let header = "sha1=deadbeef,sha1=cafebabe".to_string();
        assert!(!verify(Algorithm::Sha1, secret, payload, "sha1=", &header).unwrap());
    }

    #[test]
    fn bare_hex_digest_without_prefix_is_accepted() {
        let secret = b"topsecret";
        let payload = b"hello world";
        let good = hmac_hex_sha256(secret, payload);
        assert!(verify(Algorithm::Sha256, secret, payload, "sha256=", &good).unwrap());
    }

    #[test]
    fn constant_time_eq_matches_naive_equality() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
