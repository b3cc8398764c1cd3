//! Canonical-string HMAC-SHA256 request signatures.
//!
//! ```text
//! METHOD \n PATH \n BODY_SHA256_HEX or "-" \n TIMESTAMP
//! ```
//!
//! WebSocket upgrades sign with the pseudo-method `WEBSOCKET` and the bare
//! path. Signatures travel as lowercase hex.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::pinning::{constant_time_eq, hex_encode};

type HmacSha256 = Hmac<Sha256>;

/// Pseudo-method used in place of the HTTP method for WebSocket upgrades.
pub const WEBSOCKET_METHOD: &str = "WEBSOCKET";

/// Body digest placeholder for requests without a body.
pub const EMPTY_BODY: &str = "-";

/// Digest component of the canonical string.
pub fn body_digest(body: &[u8]) -> String {
    if body.is_empty() {
        EMPTY_BODY.to_string()
    } else {
        hex_encode(&Sha256::digest(body))
    }
}

/// Build the canonical string. `method` is upper-cased.
pub fn canonical_string(method: &str, path: &str, body: &[u8], timestamp: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        body_digest(body),
        timestamp
    )
}

/// HMAC-SHA256 over `canonical` as lowercase hex.
pub fn sign(key: &[u8], canonical: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(canonical.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Recompute and compare in constant time. Case-insensitive on the hex.
pub fn verify(key: &[u8], canonical: &str, signature_hex: &str) -> bool {
    let expected = sign(key, canonical);
    if expected.is_empty() {
        return false;
    }
    let presented = signature_hex.to_ascii_lowercase();
    constant_time_eq(expected.as_bytes(), presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
    const TS: &str = "2026-03-01T12:00:00Z";

    #[test]
    fn canonical_string_layout() {
        let s = canonical_string("get", "/v1/devices?all=1", b"", TS);
        assert_eq!(s, "GET\n/v1/devices?all=1\n-\n2026-03-01T12:00:00Z");

        let with_body = canonical_string("POST", "/v1/devices/x/revoke", b"{}", TS);
        let lines: Vec<&str> = with_body.split('\n').collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2].len(), 64);
    }

    #[test]
    fn websocket_uses_pseudo_method() {
        let s = canonical_string(WEBSOCKET_METHOD, "/v1/events", b"", TS);
        assert!(s.starts_with("WEBSOCKET\n/v1/events\n-\n"));
    }

    #[test]
    fn hmac_matches_rfc4231_case_2() {
        // RFC 4231 test case 2: key "Jefe".
        let sig = sign(b"Jefe", "what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_accepts_correct_and_rejects_tampered() {
        let canonical = canonical_string("GET", "/v1/devices", b"", TS);
        let sig = sign(KEY, &canonical);
        assert!(verify(KEY, &canonical, &sig));
        assert!(verify(KEY, &canonical, &sig.to_ascii_uppercase()));

        let other = canonical_string("GET", "/v1/devices", b"", "2026-03-01T12:00:01Z");
        assert!(!verify(KEY, &other, &sig));
        assert!(!verify(b"another key", &canonical, &sig));
        assert!(!verify(KEY, &canonical, "deadbeef"));
    }
}
