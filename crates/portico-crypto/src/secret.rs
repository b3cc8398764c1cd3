//! Device secrets and pairing tokens.
//!
//! A device secret is 32 random bytes handed to the client exactly once,
//! base64url-encoded. The daemon keeps only `secret_hash`, the hex SHA-256
//! of the encoded secret. That digest doubles as the HMAC key, so both
//! sides derive the same key without the daemon ever holding the secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::pinning::{constant_time_eq, hex_decode, hex_encode};

/// Random bytes in a device secret (256 bits).
const SECRET_LEN: usize = 32;

/// Random bytes in a pairing token (256 bits).
const TOKEN_LEN: usize = 32;

pub const PAIRING_TOKEN_PREFIX: &str = "tok_";

/// Device secret material with zeroize-on-drop.
pub struct DeviceSecret {
    encoded: String,
}

impl DeviceSecret {
    /// Wrap a secret received from elsewhere (CLI flag, client config).
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    /// The string handed to the client.
    pub fn expose(&self) -> &str {
        &self.encoded
    }

    /// Lowercase hex SHA-256 of the secret, the only form the daemon stores.
    pub fn hash_hex(&self) -> String {
        hash_secret(&self.encoded)
    }

    /// HMAC key derived from the secret.
    pub fn signing_key(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(Sha256::digest(self.encoded.as_bytes()).into())
    }
}

impl Drop for DeviceSecret {
    fn drop(&mut self) {
        self.encoded.zeroize();
    }
}

impl std::fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceSecret(<redacted>)")
    }
}

/// Generate a fresh device secret from the OS CSPRNG.
pub fn generate_device_secret() -> DeviceSecret {
    let mut raw = Zeroizing::new([0u8; SECRET_LEN]);
    OsRng.fill_bytes(&mut raw[..]);
    DeviceSecret {
        encoded: URL_SAFE_NO_PAD.encode(&raw[..]),
    }
}

pub fn hash_secret(encoded: &str) -> String {
    hex_encode(&Sha256::digest(encoded.as_bytes()))
}

/// Recover the HMAC key from a stored `secret_hash`.
///
/// `None` when the stored value is not 64 hex characters.
pub fn signing_key_from_hash(secret_hash: &str) -> Option<Zeroizing<[u8; 32]>> {
    let bytes = Zeroizing::new(hex_decode(secret_hash)?);
    let key: [u8; 32] = bytes.as_slice().try_into().ok()?;
    Some(Zeroizing::new(key))
}

/// Generate a pairing token: `tok_` + 43 base64url characters.
pub fn generate_pairing_token() -> String {
    let mut raw = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut raw);
    format!("{PAIRING_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
}

/// Compare a presented token with the issued one in constant time.
pub fn tokens_match(presented: &str, issued: &str) -> bool {
    constant_time_eq(presented.as_bytes(), issued.as_bytes())
}
