//! Local certificate authority for intercepted hosts

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{crypto, ServerConfig};

use crate::error::{ProxyError, Result};

/// Leaves stay cached for the life of the process, so they are issued with
/// at least this many days left
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Signs per-host leaf certificates with a CA the client already trusts
pub struct CertificateAuthority {
    cert: Certificate,
}

impl CertificateAuthority {
    /// Load the CA certificate and private key from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::InvalidConfig(format!("cannot read CA certificate {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            ProxyError::InvalidConfig(format!("cannot read CA key {}: {}", key_path.display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Tls(format!("invalid CA key: {}", e)))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key)
            .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {}", e)))?;
        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Tls(format!("invalid CA certificate: {}", e)))?;
        Ok(Self { cert })
    }

    /// Create a fresh self-signed CA
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::new());
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Tls(format!("failed to generate CA: {}", e)))?;
        Ok(Self { cert })
    }

    pub fn cert_pem(&self) -> Result<String> {
        self.cert
            .serialize_pem()
            .map_err(|e| ProxyError::Tls(e.to_string()))
    }

    pub fn key_pem(&self) -> String {
        self.cert.serialize_private_key_pem()
    }

    /// Issue a leaf certificate for `host` and build a TLS server config
    /// around it
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let params = leaf_params(host, Utc::now());
        let leaf = Certificate::from_params(params)
            .map_err(|e| ProxyError::Tls(format!("failed to issue certificate for {}: {}", host, e)))?;
        let cert_der = leaf
            .serialize_der_with_signer(&self.cert)
            .map_err(|e| ProxyError::Tls(format!("failed to sign certificate for {}: {}", host, e)))?;
        let key_der = leaf.serialize_private_key_der();

        let provider = Arc::new(crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(cert_der)],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
            )
            .map_err(|e| ProxyError::Tls(format!("bad certificate for {}: {}", host, e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

/// Leaf parameters for `host`. Validity runs from the start of yesterday to
/// midnight after `now + LEAF_VALIDITY_DAYS`.
fn leaf_params(host: &str, now: DateTime<Utc>) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::new());
    params.is_ca = IsCa::NoCa;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(SanType::DnsName(host.to_string()));
    }

    let from = now - Duration::days(1);
    let until = now + Duration::days(LEAF_VALIDITY_DAYS + 1);
    params.not_before = rcgen::date_time_ymd(from.year(), from.month() as u8, from.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
    params
}
