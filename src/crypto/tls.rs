//! TLS capability for the control channel
//!
//! OpenVPN tunnels TLS records inside control packets, so the handshake
//! engine never owns a socket: ciphertext is pushed in and pulled out as
//! opaque byte buffers.

use super::ZeroingData;
use crate::config::Configuration;
use crate::error::{Result, VpnError};
use md5::{Digest as _, Md5};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Server name used when no SAN host is configured
const FALLBACK_SERVER_NAME: &str = "openvpn.invalid";

/// TLS handshake capability driven through in-memory buffers
pub trait TlsCapability: Send {
    fn configure(&mut self, options: &TlsOptions) -> Result<()>;

    /// Begin the handshake, queueing the first records
    fn start(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn put_plain_text(&mut self, data: &[u8]) -> Result<()>;

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()>;

    /// Decrypted application data, `None` when nothing is available
    fn pull_plain_text(&mut self) -> Result<Option<ZeroingData>>;

    /// Records to send to the peer, `None` when nothing is pending
    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>>;

    /// Lowercase hex MD5 of the DER encoding of the first certificate in a PEM file
    fn md5(&self, certificate_path: &Path) -> Result<String>;
}

/// Builds a fresh TLS capability for each negotiation
pub type TlsFactory = Arc<dyn Fn() -> Box<dyn TlsCapability> + Send + Sync>;

/// The factory for [`RustlsTls`]
pub fn rustls_factory() -> TlsFactory {
    Arc::new(|| Box::new(RustlsTls::new()) as Box<dyn TlsCapability>)
}

/// Certificates and verification settings
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub ca_pem: Vec<u8>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<ZeroingData>,
    pub checks_san_host: bool,
    pub san_host: Option<String>,
}

impl TlsOptions {
    /// Read the PEM files named by the configuration
    pub fn from_configuration(configuration: &Configuration) -> Result<Self> {
        let read = |path: &Path| {
            fs::read(path)
                .map_err(|e| VpnError::Config(format!("Failed to read {}: {e}", path.display())))
        };
        let ca_path = configuration
            .ca_path
            .as_deref()
            .ok_or_else(|| VpnError::Config("A CA certificate is required".to_string()))?;

        Ok(Self {
            ca_pem: read(ca_path)?,
            client_cert_pem: configuration.client_cert_path.as_deref().map(read).transpose()?,
            client_key_pem: configuration
                .client_key_path
                .as_deref()
                .map(|path| read(path).map(Zeroizing::new))
                .transpose()?,
            checks_san_host: configuration.checks_san_host,
            san_host: configuration.san_host.clone(),
        })
    }
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions")
            .field("ca_pem", &self.ca_pem.len())
            .field("client_cert", &self.client_cert_pem.is_some())
            .field("checks_san_host", &self.checks_san_host)
            .field("san_host", &self.san_host)
            .finish_non_exhaustive()
    }
}

/// Chain verification against the configured CA, host name check optional
#[derive(Debug)]
struct CaVerifier {
    inner: Arc<WebPkiServerVerifier>,
    checks_san_host: bool,
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    format!("{err:?}").starts_with("NotValidForName")
}

impl ServerCertVerifier for CaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            // webpki checks the name only after the chain is valid
            Err(rustls::Error::InvalidCertificate(err))
                if !self.checks_san_host && is_name_mismatch(&err) =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| VpnError::Config(format!("Invalid certificate: {e}")))?;
    if certs.is_empty() {
        return Err(VpnError::Config("No certificate found".to_string()));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| VpnError::Config(format!("Invalid private key: {e}")))?
        .ok_or_else(|| VpnError::Config("No private key found".to_string()))
}

/// [`TlsCapability`] backed by a rustls client connection
pub struct RustlsTls {
    config: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    connection: Option<ClientConnection>,
}

impl RustlsTls {
    pub fn new() -> Self {
        Self {
            config: None,
            connection: None,
        }
    }

    fn connection_mut(&mut self) -> Result<&mut ClientConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| VpnError::Tls("TLS not started".to_string()))
    }
}

impl Default for RustlsTls {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsCapability for RustlsTls {
    fn configure(&mut self, options: &TlsOptions) -> Result<()> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&options.ca_pem)? {
            roots.add(cert)?;
        }
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| VpnError::Tls(format!("Verifier: {e}")))?;
        let verifier = Arc::new(CaVerifier {
            inner,
            checks_san_host: options.checks_san_host,
        });

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let config = match (&options.client_cert_pem, &options.client_key_pem) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(parse_certs(cert)?, parse_private_key(key)?)?
            }
            _ => builder.with_no_client_auth(),
        };

        let name = options.san_host.as_deref().unwrap_or(FALLBACK_SERVER_NAME);
        let server_name = ServerName::try_from(name)
            .map_err(|e| VpnError::Config(format!("Invalid SAN host {name}: {e}")))?
            .to_owned();
        self.config = Some((Arc::new(config), server_name));
        self.connection = None;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let (config, server_name) = self
            .config
            .clone()
            .ok_or_else(|| VpnError::Tls("TLS not configured".to_string()))?;
        self.connection = Some(ClientConnection::new(config, server_name)?);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(|conn| !conn.is_handshaking())
            .unwrap_or(false)
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<()> {
        self.connection_mut()?.writer().write_all(data)?;
        Ok(())
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        let conn = self.connection_mut()?;
        let mut reader = data;
        while !reader.is_empty() {
            if conn.read_tls(&mut reader)? == 0 {
                break;
            }
            conn.process_new_packets()?;
        }
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Option<ZeroingData>> {
        let conn = self.connection_mut()?;
        let mut out = Zeroizing::new(Vec::new());
        let mut buf = Zeroizing::new([0u8; 4096]);
        loop {
            match conn.reader().read(&mut buf[..]) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(VpnError::Tls(format!("Read failed: {e}"))),
            }
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>> {
        let conn = self.connection_mut()?;
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out)?;
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn md5(&self, certificate_path: &Path) -> Result<String> {
        let pem = fs::read(certificate_path).map_err(|e| {
            VpnError::Config(format!(
                "Failed to read {}: {e}",
                certificate_path.display()
            ))
        })?;
        let certs = parse_certs(&pem)?;
        Ok(hex::encode(Md5::digest(certs[0].as_ref())))
    }
}
