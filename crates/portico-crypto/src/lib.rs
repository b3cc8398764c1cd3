//! Portico Crypto: primitives shared by the CA, pairing and auth crates.
//!
//! SHA-256 fingerprints with constant-time comparison, random device
//! secrets and pairing tokens, and the canonical-string HMAC-SHA256
//! request signature.

pub mod pinning;
pub mod secret;
pub mod signing;
