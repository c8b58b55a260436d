//! rustls client configuration built from [`TlsSettings`]
//!
//! Trust anchors come from `ca_file`, every PEM file under `ca_path`, or the
//! platform store when neither is set. `cert_file` and `key_file` together
//! enable client authentication. `insecure` keeps chain validation but
//! accepts a certificate issued for a different host name.

use super::engine::EngineError;
use crate::session::TlsSettings;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore,
    SignatureScheme,
};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Start a client-side TLS session for `host`
pub fn client_connection(
    settings: &TlsSettings,
    host: &str,
) -> Result<ClientConnection, EngineError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| EngineError::Tls(format!("invalid server name: {host}")))?;
    let config = build_client_config(settings)?;
    ClientConnection::new(Arc::new(config), server_name).map_err(tls_error)
}

/// Build the rustls configuration, reading every referenced file
pub fn build_client_config(settings: &TlsSettings) -> Result<ClientConfig, EngineError> {
    if settings.cert_file.is_some() != settings.key_file.is_some() {
        return Err(EngineError::InvalidArgument(
            "cert_file and key_file must be set together".to_string(),
        ));
    }
    let roots = Arc::new(root_store(settings)?);

    let builder = if settings.insecure {
        warn!("TLS host name verification disabled");
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| EngineError::Tls(e.to_string()))?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyHostName { inner }))
    } else {
        ClientConfig::builder().with_root_certificates(roots)
    };

    match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_private_key(key_file)?;
            builder.with_client_auth_cert(certs, key).map_err(tls_error)
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn root_store(settings: &TlsSettings) -> Result<RootCertStore, EngineError> {
    let mut roots = RootCertStore::empty();

    if let Some(ca_file) = &settings.ca_file {
        for cert in load_certs(ca_file)? {
            roots.add(cert).map_err(tls_error)?;
        }
    }

    if let Some(ca_path) = &settings.ca_path {
        let entries = fs::read_dir(ca_path).map_err(|e| {
            EngineError::Tls(format!("cannot read CA directory {}: {e}", ca_path.display()))
        })?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => {
                    let (added, ignored) = roots.add_parsable_certificates(certs);
                    debug!(path = %path.display(), added, ignored, "Loaded CA certificates");
                }
                Err(e) => debug!(path = %path.display(), "Skipping CA file: {}", e),
            }
        }
    }

    if settings.ca_file.is_none() && settings.ca_path.is_none() {
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| EngineError::Tls(format!("cannot load platform certificates: {e}")))?;
        let (added, ignored) = roots.add_parsable_certificates(native);
        debug!(added, ignored, "Loaded platform CA certificates");
    }

    if roots.is_empty() {
        return Err(EngineError::Tls("no trusted CA certificates".to_string()));
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::Tls(format!("cannot parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(EngineError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, EngineError> {
    let file = File::open(path)
        .map_err(|e| EngineError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| EngineError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| EngineError::Tls(format!("no private key in {}", path.display())))
}

pub(crate) fn tls_error(error: rustls::Error) -> EngineError {
    EngineError::Tls(error.to_string())
}

/// Full chain validation that tolerates a host name mismatch
#[derive(Debug)]
struct AnyHostName {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for AnyHostName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
