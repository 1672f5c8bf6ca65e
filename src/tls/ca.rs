use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use rand::{RngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SerialNumber,
};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::info;
use zeroize::Zeroizing;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const CA_COMMON_NAME: &str = "layerproxy CA";
const CA_VALIDITY_YEARS: i64 = 10;

/// Signing authority for intercepted TLS connections. Clients must trust
/// [`CertificateAuthority::cert_path`] for bumped CONNECT tunnels to verify.
pub struct CertificateAuthority {
    cert_path: PathBuf,
    cert_der: Vec<u8>,
    params: CertificateParams,
    key: KeyPair,
}

impl CertificateAuthority {
    /// Loads `ca.crt`/`ca.key` from `ca_dir`, creating both on first start.
    pub fn load_or_generate<P: AsRef<Path>>(ca_dir: P) -> Result<Self> {
        let ca_dir = ca_dir.as_ref();
        fs::create_dir_all(ca_dir)
            .with_context(|| format!("failed to create CA directory {}", ca_dir.display()))?;

        let cert_path = ca_dir.join(CA_CERT_FILE);
        let key_path = ca_dir.join(CA_KEY_FILE);
        match (cert_path.exists(), key_path.exists()) {
            (false, false) => Self::generate(cert_path, &key_path),
            (true, true) => Self::load(cert_path, &key_path),
            _ => bail!(
                "incomplete CA material in {}; expected both {CA_CERT_FILE} and {CA_KEY_FILE}",
                ca_dir.display()
            ),
        }
    }

    fn generate(cert_path: PathBuf, key_path: &Path) -> Result<Self> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate CA key: {err}"))?;
        let mut params = ca_params();
        set_validity(&mut params);
        let cert = params
            .self_signed(&key)
            .map_err(|err| anyhow!("failed to self-sign CA certificate: {err}"))?;

        let key_pem = Zeroizing::new(key.serialize_pem());
        write_pem_file(&cert_path, &cert.pem(), false)?;
        write_pem_file(key_path, key_pem.as_str(), true)?;
        info!(path = %cert_path.display(), "generated certificate authority");

        Ok(Self {
            cert_path,
            cert_der: cert.der().as_ref().to_vec(),
            params,
            key,
        })
    }

    fn load(cert_path: PathBuf, key_path: &Path) -> Result<Self> {
        let cert_der = read_certificate_der(&cert_path)?;
        let key_pem = Zeroizing::new(
            fs::read_to_string(key_path)
                .with_context(|| format!("failed to read CA key {}", key_path.display()))?,
        );
        let key = KeyPair::from_pem(key_pem.as_str())
            .map_err(|err| anyhow!("failed to parse CA key: {err}"))?;
        ensure_key_matches_cert(&cert_der, &key)?;
        info!(path = %cert_path.display(), "loaded certificate authority");

        // Leaves only need the issuer name and key identifier, both derived
        // from the fixed subject and the loaded key.
        Ok(Self {
            cert_path,
            cert_der,
            params: ca_params(),
            key,
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn certificate_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    /// Mints a leaf certificate for `host`, chained to this authority.
    pub fn mint_leaf(&self, host: &str, ttl: StdDuration) -> Result<MintedLeaf> {
        ensure!(!host.is_empty(), "leaf host name must not be empty");
        ensure!(ttl > StdDuration::from_secs(0), "leaf ttl must be positive");
        let (leaf_params, expires_at) = leaf_params(host, ttl)?;
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate leaf key: {err}"))?;
        let issuer = rcgen::Issuer::from_params(&self.params, &self.key);
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|err| anyhow!("failed to sign leaf certificate for {host}: {err}"))?;

        let key_der = PrivateKeyDer::try_from(Zeroizing::new(leaf_key.serialize_der()).to_vec())
            .map_err(|err| anyhow!("failed to parse generated leaf key: {err}"))?;
        let chain = vec![
            CertificateDer::from(leaf_cert.der().as_ref().to_vec()),
            self.certificate_der(),
        ];
        let provider = ring::default_provider();
        let certified_key = CertifiedKey::from_der(chain, key_der, &provider)
            .map_err(|err| anyhow!("failed to build certified key: {err}"))?;

        Ok(MintedLeaf {
            certified_key: Arc::new(certified_key),
            expires_at,
        })
    }
}

pub struct MintedLeaf {
    pub certified_key: Arc<CertifiedKey>,
    pub expires_at: OffsetDateTime,
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.use_authority_key_identifier_extension = true;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params
}

fn set_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.serial_number = Some(random_serial());
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CA_VALIDITY_YEARS * 365);
}

fn leaf_params(host: &str, ttl: StdDuration) -> Result<(CertificateParams, OffsetDateTime)> {
    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|err| anyhow!("invalid leaf host name '{host}': {err}"))?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());
    params.distinguished_name.push(DnType::CommonName, host);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    let ttl = Duration::try_from(ttl).map_err(|_| anyhow!("leaf TTL exceeds supported range"))?;
    params.not_after = now
        .checked_add(ttl)
        .ok_or_else(|| anyhow!("leaf TTL exceeds supported range"))?;
    let expires_at = params.not_after;
    Ok((params, expires_at))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Positive and non-zero.
    bytes[0] &= 0x7F;
    bytes[15] |= 0x01;
    SerialNumber::from(bytes.to_vec())
}

fn write_pem_file(path: &Path, contents: &str, private: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options
        .write(true)
        .create_new(true)
        .mode(if private { 0o600 } else { 0o644 });
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))
}

fn read_certificate_der(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read CA certificate {}", path.display()))?;
    let mut cursor = Cursor::new(bytes);
    let mut certs = rustls_pemfile::certs(&mut cursor);
    match certs.next() {
        Some(Ok(cert)) => Ok(cert.as_ref().to_vec()),
        Some(Err(err)) => {
            Err(err).with_context(|| format!("failed to parse certificate at {}", path.display()))
        }
        None => bail!("no certificate found in {}", path.display()),
    }
}

fn ensure_key_matches_cert(cert_der: &[u8], key: &KeyPair) -> Result<()> {
    let provider = ring::default_provider();
    let key_der = PrivateKeyDer::try_from(key.serialize_der())
        .map_err(|err| anyhow!("failed to parse private key DER: {err}"))?;
    let cert = CertificateDer::from(cert_der.to_vec());
    CertifiedKey::from_der(vec![cert], key_der, &provider)
        .map_err(|err| anyhow!("CA key does not match certificate: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_material_on_first_start() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        assert_eq!(ca.cert_path(), dir.path().join(CA_CERT_FILE));
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(!ca.certificate_der().as_ref().is_empty());
        Ok(())
    }

    #[test]
    fn reloads_the_same_authority() -> Result<()> {
        let dir = TempDir::new()?;
        let first = CertificateAuthority::load_or_generate(dir.path())?;
        let second = CertificateAuthority::load_or_generate(dir.path())?;
        assert_eq!(
            first.certificate_der().as_ref(),
            second.certificate_der().as_ref()
        );
        Ok(())
    }

    #[test]
    fn rejects_half_present_material() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join(CA_CERT_FILE), "not a certificate")?;
        let err = match CertificateAuthority::load_or_generate(dir.path()) {
            Ok(_) => panic!("expected incomplete material to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("incomplete CA material"), "{err}");
        Ok(())
    }

    #[test]
    fn minted_leaf_chains_to_authority() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        let leaf = ca.mint_leaf("registry-1.docker.io", StdDuration::from_secs(3600))?;
        assert_eq!(leaf.certified_key.cert.len(), 2);
        assert_eq!(
            leaf.certified_key.cert[1].as_ref(),
            ca.certificate_der().as_ref()
        );
        assert!(leaf.expires_at > OffsetDateTime::now_utc());
        Ok(())
    }

    #[test]
    fn zero_ttl_is_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let ca = CertificateAuthority::load_or_generate(dir.path())?;
        assert!(ca.mint_leaf("example.com", StdDuration::ZERO).is_err());
        Ok(())
    }
}
