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

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::stream::Stream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// client-side TLS uses the system trust store, loaded once
static CLIENT_TLS: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                if let Err(e) = roots.add(cert) {
                    warn!("skipping unparseable system root: {e}");
                }
            }
        }
        Err(e) => warn!("cannot load system trust store: {e}"),
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

// verification disabled, origins behind self-signed or corporate chains
static CLIENT_TLS_INSECURE: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    )
});

#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// errors reaching the real server, rendered into 502 bodies
#[derive(Debug)]
pub struct UpstreamError {
    pub message: String,
}

impl UpstreamError {
    fn new(message: impl Into<String>) -> Self {
        UpstreamError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// open a connection to the origin, TLS when the captured scheme is https
pub async fn connect(
    host: &str,
    port: u16,
    tls: bool,
    insecure: bool,
) -> Result<Stream, UpstreamError> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| UpstreamError::new(format!("connect to {host}:{port} timed out")))?
        .map_err(|e| UpstreamError::new(format!("connect to {host}:{port} failed: {e}")))?;
    tcp.set_nodelay(true).ok();

    if !tls {
        return Ok(Box::new(tcp));
    }

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| UpstreamError::new(format!("invalid tls server name {host}")))?;
    let config = if insecure {
        CLIENT_TLS_INSECURE.clone()
    } else {
        CLIENT_TLS.clone()
    };
    let connector = TlsConnector::from(config);
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| UpstreamError::new(format!("tls handshake with {host}:{port} failed: {e}")))?;
    Ok(Box::new(stream))
}
