//! Leaf certificate issuance.

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use zeroize::Zeroizing;

use portico_crypto::pinning;

use crate::error::CaError;
use crate::root::{from_offset, random_serial, to_offset, RootCa};

/// Backdating applied to `not_before` to tolerate client clock skew.
const NOT_BEFORE_SKEW_SECS: i64 = 60;

const MAX_DOMAIN_LEN: usize = 253;

/// A CA-issued credential for one domain.
#[derive(Clone)]
pub struct CertificateBundle {
    pub domain: String,
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub issuer_pem: String,
    pub cert_der: Vec<u8>,
    /// Lowercase hex serial number.
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CertificateBundle {
    pub fn fullchain_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.issuer_pem)
    }

    pub fn fingerprint(&self) -> String {
        pinning::fingerprint_sha256(&self.cert_der)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("domain", &self.domain)
            .field("serial", &self.serial)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Lower-case `domain`, strip one trailing dot and check it is a DNS name.
///
/// A single leading `*.` wildcard label is allowed.
pub fn normalize_domain(domain: &str) -> Result<String, CaError> {
    let trimmed = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if trimmed.is_empty() || trimmed.len() > MAX_DOMAIN_LEN {
        return Err(CaError::InvalidDomain(domain.to_string()));
    }
    let body = trimmed.strip_prefix("*.").unwrap_or(&trimmed);
    let labels_ok = body.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if !labels_ok {
        return Err(CaError::InvalidDomain(domain.to_string()));
    }
    Ok(trimmed)
}

/// SAN strings for a domain: the domain itself, the bare host label for
/// `.local` names, and the loopback addresses.
pub fn subject_alt_names(domain: &str) -> Vec<String> {
    let mut sans = vec![domain.to_string()];
    if let Some(host) = domain.strip_suffix(".local") {
        if !host.is_empty() && !host.contains('.') && !host.starts_with('*') {
            sans.push(host.to_string());
        }
    }
    sans.push("127.0.0.1".to_string());
    sans.push("::1".to_string());
    sans
}

/// Mint a fresh leaf for an already-normalized `domain`.
///
/// Expiry is clamped strictly below the root's own expiry.
pub fn issue_leaf(
    root: &RootCa,
    domain: &str,
    lifetime: Duration,
    now: DateTime<Utc>,
) -> Result<CertificateBundle, CaError> {
    let not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    let not_after = std::cmp::min(now + lifetime, root.not_after - Duration::seconds(1));
    if not_after <= now {
        return Err(CaError::Certificate(format!(
            "root CA expires at {}, too soon to issue for {domain}",
            root.not_after
        )));
    }

    let leaf_key = KeyPair::generate().map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let sans = subject_alt_names(domain);
    let dns_sans: Vec<String> = sans
        .iter()
        .filter(|s| s.parse::<std::net::IpAddr>().is_err())
        .cloned()
        .collect();
    let mut params = CertificateParams::new(dns_sans)?;
    for san in &sans {
        if let Ok(ip) = san.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        }
    }

    params.distinguished_name.push(DnType::CommonName, domain);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let serial = random_serial();
    params.serial_number = Some(SerialNumber::from(serial.clone()));
    params.not_before = to_offset(not_before);
    params.not_after = to_offset(not_after);
    let expires_at = from_offset(params.not_after);

    let cert = params.signed_by(&leaf_key, &root.issuer, &root.key)?;

    Ok(CertificateBundle {
        domain: domain.to_string(),
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(leaf_key.serialize_pem()),
        issuer_pem: root.cert_pem.clone(),
        cert_der: cert.der().to_vec(),
        serial: pinning::hex_encode(&serial),
        issued_at: now,
        expires_at,
    })
}
