//! PEM loading and rustls configuration.
//!
//! The server side requires and verifies a client certificate against the
//! configured CA: a connection without a valid client certificate fails the
//! handshake before a single frame is read.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};

use crate::errors::TlsError;

/// Load all certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<Certificate>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).map_err(|e| TlsError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Load the first private key (PKCS#8 or RSA) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKey, TlsError> {
    let read_err = |e| TlsError::Read {
        path: path.to_path_buf(),
        source: e,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file)).map_err(read_err)?;
    if keys.is_empty() {
        let file = File::open(path).map_err(read_err)?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file)).map_err(read_err)?;
    }

    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build a root store from a CA certificate file.
pub fn load_root_store(ca_path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots.add(&cert)?;
    }
    Ok(roots)
}

/// Server-side TLS configuration: presents `cert`/`key` and requires a
/// client certificate signed by `ca`.
pub fn server_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let roots = load_root_store(ca)?;
    let verifier = AllowAnyAuthenticatedClient::new(roots);

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)?;
    Ok(Arc::new(config))
}

/// Client-side TLS configuration: trusts `ca` and presents `cert`/`key` for
/// client authentication.
pub fn client_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(load_root_store(ca)?)
        .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?;
    Ok(Arc::new(config))
}
