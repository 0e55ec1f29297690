/**
 * Copyright (c) 2025-2026 Wiretap, Inc.
 *
 * This file is part of Wiretap
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{debug, info};

use crate::error::{Result, WiretapError};
use crate::paths::ProjectPaths;

const LEAF_CACHE_CAPACITY: usize = 256;
const CA_COMMON_NAME: &str = "wiretap local CA";

/// the per-project certificate authority
///
/// generated once, persisted next to the database, trusted by clients via
/// the CA bundle environment variables. every intercepted host gets a
/// short-lived leaf signed by this CA, cached per hostname.
pub struct CertAuthority {
    issuer_cert: Certificate,
    issuer_key: KeyPair,
    ca_cert_der: CertificateDer<'static>,
    leaf_cache: Mutex<LruCache<String, Arc<rustls::ServerConfig>>>,
}

impl CertAuthority {
    /// load the CA keypair from the data directory, generating it on first use
    ///
    /// any read or write failure here is fatal, the daemon cannot intercept
    /// TLS without its CA.
    pub fn load_or_create(paths: &ProjectPaths) -> Result<Self> {
        let cert_path = paths.ca_cert_file();
        let key_path = paths.ca_key_file();

        let (cert_pem, key_pem) = if cert_path.exists() || key_path.exists() {
            if !cert_path.exists() || !key_path.exists() {
                return Err(WiretapError::Internal(format!(
                    "partial CA material: both {} and {} must exist",
                    cert_path.display(),
                    key_path.display()
                )));
            }
            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|e| WiretapError::Internal(format!("reading CA cert: {e}")))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|e| WiretapError::Internal(format!("reading CA key: {e}")))?;
            debug!("loaded CA from {}", cert_path.display());
            (cert_pem, key_pem)
        } else {
            let (cert_pem, key_pem) = generate_ca()?;
            write_with_mode(&key_path, key_pem.as_bytes(), 0o600)?;
            write_with_mode(&cert_path, cert_pem.as_bytes(), 0o644)?;
            info!("generated project CA at {}", cert_path.display());
            (cert_pem, key_pem)
        };

        let issuer_key = KeyPair::from_pem(&key_pem)
            .map_err(|e| WiretapError::Internal(format!("parsing CA key: {e}")))?;
        let issuer_params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| WiretapError::Internal(format!("parsing CA cert: {e}")))?;
        let issuer_cert = issuer_params
            .self_signed(&issuer_key)
            .map_err(|e| WiretapError::Internal(format!("rebuilding CA cert: {e}")))?;
        let ca_cert_der = parse_single_cert_pem(&cert_pem)?;

        Ok(CertAuthority {
            issuer_cert,
            issuer_key,
            ca_cert_der,
            leaf_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(LEAF_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    /// a rustls server config presenting a leaf for `host`
    ///
    /// minted on demand and cached by hostname. a mint failure only fails
    /// this host, the caller turns it into a 502.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        if let Some(config) = self.leaf_cache.lock().get(host) {
            return Ok(config.clone());
        }

        let (leaf_der, key_der) = self.mint_leaf(host)?;
        let chain = vec![leaf_der, self.ca_cert_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| WiretapError::Internal(format!("leaf config for {host}: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.leaf_cache
            .lock()
            .put(host.to_string(), config.clone());
        debug!("minted leaf certificate for {host}");
        Ok(config)
    }

    /// sign one leaf for the host, SAN carries the name or address
    fn mint_leaf(&self, host: &str) -> Result<(CertificateDer<'static>, Vec<u8>)> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut params = CertificateParams::new(Vec::<String>::new())
                .map_err(|e| WiretapError::Internal(format!("leaf params for {host}: {e}")))?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|e| WiretapError::Internal(format!("leaf params for {host}: {e}")))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| WiretapError::Internal(format!("leaf key for {host}: {e}")))?;
        let leaf = params
            .signed_by(&leaf_key, &self.issuer_cert, &self.issuer_key)
            .map_err(|e| WiretapError::Internal(format!("signing leaf for {host}: {e}")))?;

        Ok((leaf.der().clone(), leaf_key.serialize_der()))
    }
}

/// self-signed CA certificate scoped to this project
fn generate_ca() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| WiretapError::Internal(format!("generating CA key: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| WiretapError::Internal(format!("generating CA cert: {e}")))?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn parse_single_cert_pem(pem: &str) -> Result<CertificateDer<'static>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let first = rustls_pemfile::certs(&mut reader)
        .next()
        .transpose()
        .map_err(|e| WiretapError::Internal(format!("decoding CA pem: {e}")))?
        .ok_or_else(|| WiretapError::Internal("no certificate in CA pem".to_string()));
    first
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(|e| WiretapError::Internal(format!("creating {}: {e}", path.display())))?;
    file.write_all(contents)
        .map_err(|e| WiretapError::Internal(format!("writing {}: {e}", path.display())))?;
    file.sync_all()
        .map_err(|e| WiretapError::Internal(format!("syncing {}: {e}", path.display())))?;
    Ok(())
}
