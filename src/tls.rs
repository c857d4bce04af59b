//! TLS client configuration shared by every connection of a run.

use crate::error::{Error, Result};
use log::warn;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Wire protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TlsOptions<'a> {
    /// Accept any server certificate
    pub insecure: bool,
    pub cert_file: Option<&'a Path>,
    pub key_file: Option<&'a Path>,
    /// Offer h2 through ALPN
    pub http2: bool,
}

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Builds the client configuration. A client certificate that fails to
/// load is logged and the configuration falls back to no client auth.
pub fn client_config(options: &TlsOptions<'_>) -> Result<Arc<ClientConfig>> {
    let identity = match (options.cert_file, options.key_file) {
        (Some(cert), Some(key)) => match load_identity(cert, key) {
            Ok(identity) => Some(identity),
            Err(err) => {
                warn!("{}, continuing without client certificate", err);
                None
            }
        },
        (Some(_), None) | (None, Some(_)) => {
            warn!("both a certificate and a key are required for mutual TLS, ignoring");
            None
        }
        (None, None) => None,
    };

    let attempt = identity
        .as_ref()
        .map(|(certs, key)| (certs.clone(), key.clone_key()));
    let mut config = match assemble(options.insecure, attempt) {
        Ok(config) => config,
        Err(err) if identity.is_some() => {
            warn!(
                "{}, continuing without client certificate",
                Error::CredentialLoad(err.to_string())
            );
            assemble(options.insecure, None).map_err(|e| Error::Config(e.to_string()))?
        }
        Err(err) => return Err(Error::Config(err.to_string())),
    };

    config.alpn_protocols = if options.http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(Arc::new(config))
}

fn assemble(insecure: bool, identity: Option<Identity>) -> std::result::Result<ClientConfig, rustls::Error> {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?;

    let builder = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        // Pin the client's own certificate as well, for private CAs.
        if let Some(leaf) = identity.as_ref().and_then(|(certs, _)| certs.first()) {
            if let Err(err) = roots.add(leaf.clone()) {
                warn!("client certificate not added to the trust store: {}", err);
            }
        }
        builder.with_root_certificates(roots)
    };

    match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Reads a PEM certificate chain and private key.
pub fn load_identity(cert_file: &Path, key_file: &Path) -> Result<Identity> {
    let certs = {
        let file = File::open(cert_file).map_err(|e| {
            Error::CredentialLoad(format!("open {}: {}", cert_file.display(), e))
        })?;
        rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::CredentialLoad(format!("parse {}: {}", cert_file.display(), e)))?
    };
    if certs.is_empty() {
        return Err(Error::CredentialLoad(format!(
            "no certificate found in {}",
            cert_file.display()
        )));
    }

    let file = File::open(key_file)
        .map_err(|e| Error::CredentialLoad(format!("open {}: {}", key_file.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::CredentialLoad(format!("parse {}: {}", key_file.display(), e)))?
        .ok_or_else(|| {
            Error::CredentialLoad(format!("no private key found in {}", key_file.display()))
        })?;

    Ok((certs, key))
}

/// Server name used for SNI and certificate checks.
pub fn server_name(host: &str) -> Option<ServerName<'static>> {
    ServerName::try_from(host.trim_start_matches('[').trim_end_matches(']').to_string()).ok()
}

/// Maps the ALPN result to the protocol to speak. Asking for h2 and not
/// getting it is a [`Error::ProtocolUpgrade`]; callers fall back to HTTP/1.1.
pub fn negotiated_protocol(alpn: Option<&[u8]>, want_http2: bool) -> Result<Protocol> {
    match (want_http2, alpn) {
        (false, _) => Ok(Protocol::Http1),
        (true, Some(b"h2")) => Ok(Protocol::Http2),
        (true, other) => Err(Error::ProtocolUpgrade(format!(
            "server selected {}",
            other
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_else(|| "no protocol".to_string())
        ))),
    }
}

/// Accepts every server certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        let provider: CryptoProvider = ring::default_provider();
        provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insecure_config_builds() {
        let config = client_config(&TlsOptions {
            insecure: true,
            ..TlsOptions::default()
        })
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_http2_offers_h2_first() {
        let config = client_config(&TlsOptions {
            insecure: false,
            http2: true,
            ..TlsOptions::default()
        })
        .unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }

    #[test]
    fn test_missing_credentials_are_reported() {
        let err = load_identity(
            Path::new("/nonexistent/client.pem"),
            Path::new("/nonexistent/client.key"),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CredentialLoad(_)));
    }

    #[test]
    fn test_missing_credentials_degrade_to_plain_tls() {
        let config = client_config(&TlsOptions {
            insecure: true,
            cert_file: Some(Path::new("/nonexistent/client.pem")),
            key_file: Some(Path::new("/nonexistent/client.key")),
            http2: false,
        });
        assert!(config.is_ok());
    }

    #[test]
    fn test_negotiated_protocol() {
        assert_eq!(negotiated_protocol(None, false).unwrap(), Protocol::Http1);
        assert_eq!(
            negotiated_protocol(Some(b"h2"), true).unwrap(),
            Protocol::Http2
        );
        assert!(matches!(
            negotiated_protocol(Some(b"http/1.1"), true),
            Err(Error::ProtocolUpgrade(_))
        ));
        assert!(matches!(
            negotiated_protocol(None, true),
            Err(Error::ProtocolUpgrade(_))
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_some());
        assert!(server_name("127.0.0.1").is_some());
        assert!(server_name("[::1]").is_some());
        assert!(server_name("bad name").is_none());
    }
}
