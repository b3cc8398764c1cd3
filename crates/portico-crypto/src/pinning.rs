//! Fingerprinting and constant-time comparison.
//!
//! Clients record the root certificate's SHA-256 fingerprint from the QR
//! payload and compare it with the certificate served by `/v1/ca/root.pem`.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compute a SHA-256 fingerprint of `data` (usually a DER certificate).
///
/// Returns the fingerprint as a lowercase hex string.
pub fn fingerprint_sha256(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

/// Compare two strings in constant time.
///
/// Length is not secret: strings of different length never match.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Decode a hex string (either case). `None` on odd length or bad digits.
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let data = b"test certificate DER data";
        assert_eq!(fingerprint_sha256(data), fingerprint_sha256(data));
    }

    #[test]
    fn fingerprint_is_hex_string() {
        let fp = fingerprint_sha256(b"test certificate DER data");
        // SHA-256 produces 32 bytes = 64 hex chars
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn known_vector() {
        assert_eq!(
            fingerprint_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn matching_and_non_matching() {
        let a = fingerprint_sha256(b"cert A");
        let b = fingerprint_sha256(b"cert B");
        assert!(fingerprints_match(&a, &a));
        assert!(!fingerprints_match(&a, &b));
        assert!(!fingerprints_match("abc", "abcd"));
    }

    #[test]
    fn hex_decode_accepts_both_cases_and_rejects_garbage() {
        assert_eq!(hex_decode("00ffA0"), Some(vec![0x00, 0xff, 0xa0]));
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
        assert_eq!(hex_decode(""), Some(vec![]));
    }
}
