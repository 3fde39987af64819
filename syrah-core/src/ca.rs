use crate::error::BridgeError;
use crate::Result;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::info;

const CERT_FILE: &str = "syrah-ca.pem";
const KEY_FILE: &str = "syrah-ca.key";

/// Root CA the interception engine signs per-host certificates with.
///
/// Only the private key is persisted in a reusable form: rcgen cannot sign
/// with a parsed certificate, so a loaded CA is rebuilt from the same
/// parameters and key. Clients that trusted the first certificate keep
/// trusting the rebuilt one because subject and key are unchanged.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    cert_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA stored in `dir`, or generate and store a new one.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let key_pem = fs::read_to_string(&key_path)?;
            let ca = Self::from_key_pem(&key_pem, cert_path)?;
            info!("Loaded CA from {}", dir.display());
            return Ok(ca);
        }

        fs::create_dir_all(dir)?;
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| BridgeError::Certificate(format!("Failed to generate CA key: {}", e)))?;
        let ca = Self::build(key_pair, cert_path)?;

        fs::write(&ca.cert_path, ca.cert_pem()?)?;
        fs::write(&key_path, ca.ca_cert.serialize_private_key_pem())?;
        info!(
            "Generated new CA at {}. Install it on client devices to intercept HTTPS",
            ca.cert_path.display()
        );
        Ok(ca)
    }

    fn from_key_pem(key_pem: &str, cert_path: PathBuf) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| BridgeError::Certificate(format!("Failed to parse CA key: {}", e)))?;
        Self::build(key_pair, cert_path)
    }

    fn build(key_pair: KeyPair, cert_path: PathBuf) -> Result<Self> {
        let mut params = ca_params();
        params.key_pair = Some(key_pair);
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| BridgeError::Certificate(format!("Failed to build CA cert: {}", e)))?;
        Ok(Self { ca_cert, cert_path })
    }

    /// Where the PEM certificate for client installation lives.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| BridgeError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    pub fn cert_der(&self) -> Result<Vec<u8>> {
        self.ca_cert
            .serialize_der()
            .map_err(|e| BridgeError::Certificate(format!("Failed to serialize CA cert DER: {}", e)))
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.ca_cert.serialize_private_key_der()
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Syrah CA");
    dn.push(DnType::OrganizationName, "Syrah");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    // 10 years
    let not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(365 * 10);
    params
}
