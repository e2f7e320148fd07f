//! Root CA handling and per-host leaf issuance.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Utc};
use log::{debug, info};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use super::types::RootCertificate;
use crate::error_handling::types::ProxyError;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Signs leaf certificates for intercepted hosts with the configured root CA.
///
/// Server configurations are cached per host for the lifetime of the authority
/// (one proxy session).
pub struct CertificateAuthority {
    identifier: String,
    issuer: Certificate,
    issuer_key: KeyPair,
    provider: Arc<CryptoProvider>,
    leaves: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Loads the CA certificate and private key from PEM files.
    pub fn load(root: &RootCertificate) -> Result<Self, ProxyError> {
        let cert_pem = std::fs::read_to_string(&root.cert_path).map_err(|e| {
            ProxyError::CertificateError(format!("{}: {}", root.cert_path.display(), e))
        })?;
        let key_pem = std::fs::read_to_string(&root.key_path).map_err(|e| {
            ProxyError::CertificateError(format!("{}: {}", root.key_path.display(), e))
        })?;
        let issuer_key = KeyPair::from_pem(&key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let issuer = params.self_signed(&issuer_key)?;
        info!("Loaded root CA {} from {}", root.identifier, root.cert_path.display());
        Ok(Self {
            identifier: root.identifier.clone(),
            issuer,
            issuer_key,
            provider: crypto_provider(),
            leaves: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a new self-signed root CA and writes it as PEM to the given paths.
    pub fn generate(common_name: &str, cert_path: &Path, key_path: &Path) -> Result<(), ProxyError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, "mirador");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let year = Utc::now().year();
        params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(year + 10, 12, 31);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        std::fs::write(cert_path, cert.pem())?;
        std::fs::write(key_path, key.serialize_pem())?;
        info!(
            "Generated root CA '{}' at {} (key {})",
            common_name,
            cert_path.display(),
            key_path.display()
        );
        Ok(())
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// TLS server configuration presenting a leaf certificate for `host`.
    ///
    /// Fails for names no certificate can be issued for; callers tunnel those
    /// connections without interception.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let key = host.to_ascii_lowercase();
        if let Some(config) = self
            .leaves
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(config));
        }

        let config = Arc::new(self.issue(&key)?);
        self.leaves
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&config));
        Ok(config)
    }

    fn issue(&self, host: &str) -> Result<ServerConfig, ProxyError> {
        if host.is_empty() || !host.is_ascii() {
            return Err(ProxyError::CertificateError(format!(
                "cannot issue a certificate for {:?}",
                host
            )));
        }
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let year = Utc::now().year();
        params.not_before = rcgen::date_time_ymd(year - 1, 1, 1);
        params.not_after = rcgen::date_time_ymd(year + 1, 12, 31);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.issuer, &self.issuer_key)?;
        debug!("Issued leaf certificate for {}", host);

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    pub fn cached_hosts(&self) -> usize {
        self.leaves.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
