//! Local certificate authority: loads (or mints, on first run) a CA
//! keypair and signs per-host leaf certificates on demand for `TlsLayer`
//! (spec.md §4.3). Mirrors the teacher's pattern of loading a long-lived
//! credential once at startup and handing out `Arc`-shared config objects
//! to every connection.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::error::{ProxyError, Result};

/// Root signing certificate plus a cache of per-SNI leaf certificates
/// minted on demand, keyed by hostname.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    cache: Mutex<std::collections::HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateAuthority {
    /// Loads a CA keypair/cert from `cert_path`/`key_path` if both exist,
    /// otherwise mints a fresh self-signed CA and writes it there so
    /// restarts reuse the same root (and so it can be imported into a
    /// client trust store once).
    pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(cert_path).map_err(ProxyError::Io)?;
            let key_pem = fs::read_to_string(key_path).map_err(ProxyError::Io)?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|e| ProxyError::Tls(format!("invalid CA key: {e}")))?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .map_err(|e| ProxyError::Tls(format!("invalid CA cert: {e}")))?;
            let ca_cert = params
                .self_signed(&key_pair)
                .map_err(|e| ProxyError::Tls(format!("failed to re-sign CA cert: {e}")))?;
            return Ok(Self {
                ca_cert,
                ca_key: key_pair,
                cache: Mutex::new(std::collections::HashMap::new()),
            });
        }

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "microproxy MITM CA");
        dn.push(DnType::OrganizationName, "microproxy");
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().map_err(|e| ProxyError::Tls(e.to_string()))?;
        let ca_cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        if let Some(parent) = cert_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(cert_path, ca_cert.pem());
        let _ = fs::write(key_path, key_pair.serialize_pem());

        Ok(Self {
            ca_cert,
            ca_key: key_pair,
            cache: Mutex::new(std::collections::HashMap::new()),
        })
    }

    /// Returns a cached `ServerConfig` for `host`, minting and signing a
    /// fresh leaf certificate on first use. ALPN protocols are advertised
    /// so the downstream handshake can negotiate h2 when the upstream did.
    pub fn server_config_for(&self, host: &str, alpn: &[Vec<u8>]) -> Result<Arc<ServerConfig>> {
        if let Some(cfg) = self.cache.lock().get(host) {
            return Ok(cfg.clone());
        }

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(
            host.to_string()
                .try_into()
                .map_err(|_| ProxyError::Tls("invalid SNI hostname".into()))?,
        )];
        let leaf_key = KeyPair::generate().map_err(|e| ProxyError::Tls(e.to_string()))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let cert_der: CertificateDer<'static> = leaf_cert.der().clone();
        let key_der: PrivateKeyDer<'static> =
            PrivatePkcs8KeyDer::from(leaf_key.serialize_der()).into();

        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| ProxyError::Tls(e.to_string()))?;
        server_config.alpn_protocols = alpn.to_vec();

        let config = Arc::new(server_config);
        self.cache.lock().insert(host.to_string(), config.clone());
        Ok(config)
    }

    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert.pem()
    }
}
