//! rustls configuration for the tunnel control connection.
//!
//! The control plane uses mutual TLS: the server presents its certificate and
//! requires a client certificate signed by the configured CA. Certificate
//! issuance is out of scope; material is read from PEM files or in-memory
//! strings.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use crate::TunnelError;

fn read_certs(reader: &mut dyn BufRead, what: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse {}: {}", what, e)))
}

fn read_key(reader: &mut dyn BufRead, what: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse {}: {}", what, e)))?
        .ok_or_else(|| TunnelError::Certificate(format!("No private key found in {}", what)))
}

fn file_reader(path: &Path) -> Result<BufReader<File>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Certificate(format!("Failed to open {:?}: {}", path, e)))?;
    Ok(BufReader::new(file))
}

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore, TunnelError> {
    let mut store = RootCertStore::empty();
    for cert in ca_certs {
        store
            .add(cert)
            .map_err(|e| TunnelError::Certificate(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(store)
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> Result<ServerConfig, TunnelError> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_certs)?))
        .build()
        .map_err(|e| TunnelError::Tls(format!("Failed to build client verifier: {}", e)))?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))
}

fn build_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    ca_certs: Vec<CertificateDer<'static>>,
) -> Result<ClientConfig, TunnelError> {
    ClientConfig::builder()
        .with_root_certificates(root_store(ca_certs)?)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build client config: {}", e)))
}

/// Server TLS config requiring client certificates, from PEM files.
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<ServerConfig, TunnelError> {
    let certs = read_certs(&mut file_reader(cert_path)?, "server certificate")?;
    let key = read_key(&mut file_reader(key_path)?, "server key")?;
    let ca = read_certs(&mut file_reader(ca_path)?, "CA certificate")?;
    build_server_config(certs, key, ca)
}

/// Client TLS config presenting a client certificate, from PEM files.
pub fn load_client_config(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<ClientConfig, TunnelError> {
    let certs = read_certs(&mut file_reader(cert_path)?, "client certificate")?;
    let key = read_key(&mut file_reader(key_path)?, "client key")?;
    let ca = read_certs(&mut file_reader(ca_path)?, "CA certificate")?;
    build_client_config(certs, key, ca)
}

/// Server TLS config requiring client certificates, from in-memory PEM.
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    let certs = read_certs(&mut Cursor::new(cert_pem.as_bytes()), "server certificate")?;
    let key = read_key(&mut Cursor::new(key_pem.as_bytes()), "server key")?;
    let ca = read_certs(&mut Cursor::new(ca_pem.as_bytes()), "CA certificate")?;
    build_server_config(certs, key, ca)
}

/// Client TLS config presenting a client certificate, from in-memory PEM.
pub fn load_client_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ClientConfig, TunnelError> {
    let certs = read_certs(&mut Cursor::new(cert_pem.as_bytes()), "client certificate")?;
    let key = read_key(&mut Cursor::new(key_pem.as_bytes()), "client key")?;
    let ca = read_certs(&mut Cursor::new(ca_pem.as_bytes()), "CA certificate")?;
    build_client_config(certs, key, ca)
}
