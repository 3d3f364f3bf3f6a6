//! Certificate Authority for TLS interception.
//!
//! Generates and stores the root CA and signs per-host leaf certificates
//! on demand. Leaves are cached per host for the lifetime of the process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::CaError;

/// CA certificate and key file names.
const CA_CERT_FILENAME: &str = "strata-ca.crt";
const CA_KEY_FILENAME: &str = "strata-ca.key";

const CA_COMMON_NAME: &str = "Strata Root CA";

/// A signed leaf certificate and its private key.
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub cert: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl LeafCert {
    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Manages the root CA and the leaves it signs.
#[derive(Clone)]
pub struct CertificateAuthority {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    issuer: Arc<Mutex<Option<Issuer<'static, KeyPair>>>>,
    leaves: Arc<Mutex<HashMap<String, LeafCert>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_dir", &self.ca_dir)
            .field("loaded", &self.issuer.lock().is_some())
            .field("leaves", &self.leaves.lock().len())
            .finish()
    }
}

/// Parameters of the root certificate. Regenerating them for the stored key
/// yields an issuer whose name matches the certificate on disk.
fn ca_params() -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| CaError::Generation(e.to_string()))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CA_COMMON_NAME);
    name.push(DnType::OrganizationName, "Strata");
    params.distinguished_name = name;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    Ok(params)
}

impl CertificateAuthority {
    /// Creates a CA rooted in the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            issuer: Arc::new(Mutex::new(None)),
            leaves: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Creates a CA in the platform data directory.
    pub fn with_default_dir() -> Result<Self, CaError> {
        let project_dirs = directories::ProjectDirs::from("org", "strata", "Strata")
            .ok_or_else(|| CaError::Generation("Failed to get project dirs".into()))?;
        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Generates the CA if it is missing, then loads it.
    pub fn ensure_ca(&self) -> Result<(), CaError> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load()
    }

    /// Generates a new root CA certificate and key.
    pub fn generate_ca(&self) -> Result<(), CaError> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;
        let cert = ca_params()?
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())?;
        fs::write(self.key_path(), key_pair.serialize_pem())?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the stored key as the signing issuer.
    pub fn load(&self) -> Result<(), CaError> {
        let key_pem = fs::read_to_string(self.key_path())?;
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        *self.issuer.lock() = Some(Issuer::new(ca_params()?, key_pair));
        self.leaves.lock().clear();
        Ok(())
    }

    /// Reads the CA certificate PEM (for installation instructions).
    pub fn read_cert_pem(&self) -> Result<String, CaError> {
        Ok(fs::read_to_string(self.cert_path())?)
    }

    /// A leaf certificate for `host`, signed by the CA.
    pub fn leaf(&self, host: &str) -> Result<LeafCert, CaError> {
        let host = host.to_ascii_lowercase();
        if let Some(leaf) = self.leaves.lock().get(&host) {
            return Ok(leaf.clone());
        }

        let issuer = self.issuer.lock();
        let issuer = issuer
            .as_ref()
            .ok_or_else(|| CaError::Generation("CA not loaded".into()))?;

        let mut params = CertificateParams::new(vec![host.clone()]).map_err(|e| CaError::Generation(e.to_string()))?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, host.as_str());
        params.distinguished_name = name;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, issuer)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let leaf = LeafCert {
            cert: cert.der().clone(),
            key_der: key_pair.serialize_der(),
        };
        self.leaves.lock().insert(host, leaf.clone());
        Ok(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_paths() {
        let ca = CertificateAuthority::new("/tmp/test-ca");
        assert_eq!(ca.cert_path(), PathBuf::from("/tmp/test-ca/strata-ca.crt"));
        assert_eq!(ca.key_path(), PathBuf::from("/tmp/test-ca/strata-ca.key"));
    }

    #[test]
    fn ensure_ca_generates_if_missing() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(temp_dir.path().join("ca"));
        assert!(!ca.ca_exists());

        ca.ensure_ca().unwrap();
        assert!(ca.ca_exists());
        assert!(ca.read_cert_pem().unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn leaf_requires_loaded_ca() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(temp_dir.path().join("ca"));
        assert!(ca.leaf("example.com").is_err());
    }

    #[test]
    fn leaves_are_cached_per_host() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(temp_dir.path().join("ca"));
        ca.ensure_ca().unwrap();

        let a = ca.leaf("Example.com").unwrap();
        let b = ca.leaf("example.com").unwrap();
        assert_eq!(a.cert, b.cert);
        let c = ca.leaf("other.example").unwrap();
        assert_ne!(a.cert, c.cert);
    }

    #[test]
    fn reload_keeps_the_same_key() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new(temp_dir.path().join("ca"));
        ca.ensure_ca().unwrap();
        let key_before = fs::read_to_string(ca.key_path()).unwrap();

        let again = CertificateAuthority::new(temp_dir.path().join("ca"));
        again.ensure_ca().unwrap();
        assert_eq!(fs::read_to_string(again.key_path()).unwrap(), key_before);
        assert!(again.leaf("example.com").is_ok());
    }
}
