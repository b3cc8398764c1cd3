//! Root CA creation and loading.
//!
//! The root is an ECDSA P-256 self-signed certificate. Its key and
//! certificate live in `<data>/ca/`; the key file is owner-only. An
//! existing, unexpired root is always reused.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use zeroize::Zeroizing;

use portico_common::persist;
use portico_crypto::pinning;

use crate::error::CaError;

const ROOT_CERT_FILENAME: &str = "root.pem";
const ROOT_KEY_FILENAME: &str = "root-key.pem";

/// In-memory root CA, ready to sign leaves.
pub struct RootCa {
    pub(crate) key: KeyPair,
    /// Issuer view used by `signed_by`. Shares the key and subject of the
    /// on-disk certificate.
    pub(crate) issuer: rcgen::Certificate,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub fingerprint: String,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("fingerprint", &self.fingerprint)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// How `ensure_root` obtained the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOrigin {
    Created,
    Loaded,
    /// The previous root had expired; it was archived and replaced.
    Renewed,
}

pub fn root_cert_path(dir: &Path) -> PathBuf {
    dir.join(ROOT_CERT_FILENAME)
}

pub fn root_key_path(dir: &Path) -> PathBuf {
    dir.join(ROOT_KEY_FILENAME)
}

pub fn ensure_root(
    dir: &Path,
    common_name: &str,
    lifetime: Duration,
) -> Result<(RootCa, RootOrigin), CaError> {
    ensure_root_at(dir, common_name, lifetime, Utc::now())
}

/// Load the root from `dir`, or create it if absent.
pub fn ensure_root_at(
    dir: &Path,
    common_name: &str,
    lifetime: Duration,
    now: DateTime<Utc>,
) -> Result<(RootCa, RootOrigin), CaError> {
    let cert_path = root_cert_path(dir);
    let key_path = root_key_path(dir);

    match (cert_path.exists(), key_path.exists()) {
        (false, false) => {
            let root = create_root(dir, common_name, lifetime, now)?;
            tracing::info!(fingerprint = %root.fingerprint, path = %cert_path.display(), "Root CA created");
            Ok((root, RootOrigin::Created))
        }
        (true, true) => {
            let root = load_root(dir)?;
            if root.not_after > now {
                tracing::debug!(fingerprint = %root.fingerprint, "Root CA loaded");
                return Ok((root, RootOrigin::Loaded));
            }
            tracing::warn!(
                fingerprint = %root.fingerprint,
                expired = %root.not_after,
                "Root CA expired, archiving and creating a new one"
            );
            archive_root(dir, now)?;
            let root = create_root(dir, common_name, lifetime, now)?;
            Ok((root, RootOrigin::Renewed))
        }
        _ => Err(CaError::RootCorrupt(format!(
            "only one of {ROOT_CERT_FILENAME} and {ROOT_KEY_FILENAME} exists in {}",
            dir.display()
        ))),
    }
}

fn build_root_params(
    common_name: &str,
    now: DateTime<Utc>,
    lifetime: Duration,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Portico");

    // No intermediates: the root signs leaves directly.
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(random_serial()));
    params.not_before = to_offset(now);
    params.not_after = to_offset(now + lifetime);
    params
}

fn create_root(
    dir: &Path,
    common_name: &str,
    lifetime: Duration,
    now: DateTime<Utc>,
) -> Result<RootCa, CaError> {
    let key = KeyPair::generate().map_err(|e| CaError::KeyGeneration(e.to_string()))?;
    let params = build_root_params(common_name, now, lifetime);
    let not_after = from_offset(params.not_after);
    let cert = params.self_signed(&key)?;

    let cert_pem = cert.pem();
    let cert_der = cert.der().to_vec();
    let key_pem = Zeroizing::new(key.serialize_pem());

    std::fs::create_dir_all(dir)?;
    persist::write_private(&root_key_path(dir), key_pem.as_bytes())?;
    std::fs::write(root_cert_path(dir), &cert_pem)?;

    Ok(RootCa {
        key,
        issuer: cert,
        fingerprint: pinning::fingerprint_sha256(&cert_der),
        cert_pem,
        cert_der,
        not_after,
    })
}

fn load_root(dir: &Path) -> Result<RootCa, CaError> {
    let key_pem = Zeroizing::new(std::fs::read_to_string(root_key_path(dir))?);
    let cert_pem = std::fs::read_to_string(root_cert_path(dir))?;

    let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::RootCorrupt(e.to_string()))?;
    let parsed = pem::parse(&cert_pem).map_err(|e| CaError::RootCorrupt(e.to_string()))?;
    let cert_der = parsed.contents().to_vec();

    // Rebuild params from the stored certificate so subject, validity and
    // key identifier match what clients already trust.
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| CaError::RootCorrupt(e.to_string()))?;
    let not_after = from_offset(params.not_after);
    let issuer = params.self_signed(&key)?;

    Ok(RootCa {
        key,
        issuer,
        fingerprint: pinning::fingerprint_sha256(&cert_der),
        cert_pem,
        cert_der,
        not_after,
    })
}

fn archive_root(dir: &Path, now: DateTime<Utc>) -> Result<(), CaError> {
    let suffix = now.format("%Y%m%d%H%M%S");
    for path in [root_cert_path(dir), root_key_path(dir)] {
        let mut archived = path.clone().into_os_string();
        archived.push(format!(".expired-{suffix}"));
        std::fs::rename(&path, PathBuf::from(archived))?;
    }
    Ok(())
}

/// Random positive 16-byte serial.
pub(crate) fn random_serial() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Positive, and never a leading zero byte that DER would strip.
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    bytes.to_vec()
}

pub(crate) fn to_offset(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .unwrap_or(time::OffsetDateTime::now_utc())
}

pub(crate) fn from_offset(odt: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(odt.unix_timestamp(), 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_common::test::unique_temp_dir;

    const CN: &str = "Portico Test Root";

    #[test]
    fn cold_start_creates_exactly_one_root_then_reuses_it() {
        let dir = unique_temp_dir("ca-root");

        let (first, origin) = ensure_root(&dir, CN, Duration::days(3650)).unwrap();
        assert_eq!(origin, RootOrigin::Created);
        assert!(first.cert_pem.contains("BEGIN CERTIFICATE"));

        let (second, origin) = ensure_root(&dir, CN, Duration::days(3650)).unwrap();
        assert_eq!(origin, RootOrigin::Loaded);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.not_after, second.not_after);
    }

    #[cfg(unix)]
    #[test]
    fn root_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = unique_temp_dir("ca-root-perms");
        ensure_root(&dir, CN, Duration::days(30)).unwrap();
        let mode = std::fs::metadata(root_key_path(&dir))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn half_configured_root_is_an_error() {
        let dir = unique_temp_dir("ca-root-half");
        ensure_root(&dir, CN, Duration::days(30)).unwrap();
        std::fs::remove_file(root_key_path(&dir)).unwrap();

        let err = ensure_root(&dir, CN, Duration::days(30)).unwrap_err();
        assert!(matches!(err, CaError::RootCorrupt(_)));
        assert!(root_cert_path(&dir).exists(), "existing cert left untouched");
    }

    #[test]
    fn garbage_root_is_reported_not_overwritten() {
        let dir = unique_temp_dir("ca-root-garbage");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(root_cert_path(&dir), "not a cert").unwrap();
        std::fs::write(root_key_path(&dir), "not a key").unwrap();

        let err = ensure_root(&dir, CN, Duration::days(30)).unwrap_err();
        assert!(matches!(err, CaError::RootCorrupt(_)));
        assert_eq!(
            std::fs::read_to_string(root_cert_path(&dir)).unwrap(),
            "not a cert"
        );
    }

    #[test]
    fn expired_root_is_archived_and_replaced() {
        let dir = unique_temp_dir("ca-root-expired");
        let (old, _) = ensure_root(&dir, CN, Duration::days(1)).unwrap();

        let later = Utc::now() + Duration::days(2);
        let (new, origin) = ensure_root_at(&dir, CN, Duration::days(30), later).unwrap();
        assert_eq!(origin, RootOrigin::Renewed);
        assert_ne!(old.fingerprint, new.fingerprint);

        let archived = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".expired-"))
            .count();
        assert_eq!(archived, 2);
    }
}
