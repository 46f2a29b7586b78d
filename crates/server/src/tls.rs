//! TLS termination for the front door: a certificate pair from the
//! configuration, or an ephemeral self-signed certificate when none is
//! configured (fine for localhost, useless for real deployments).

use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

type CertPair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Build the acceptor the accept loop hands every TCP connection to.
/// Both paths must be set to use an on-disk certificate; otherwise a
/// throwaway one is generated in memory.
pub fn acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> Result<TlsAcceptor> {
    let (chain, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => from_pem_files(cert, key)?,
        _ => ephemeral_certificate()?,
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("rustls rejected the certificate chain")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn from_pem_files(cert_path: &str, key_path: &str) -> Result<CertPair> {
    let file = std::fs::File::open(cert_path)
        .with_context(|| format!("Cannot open TLS certificate {cert_path}"))?;
    let mut chain = Vec::new();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        chain.push(cert.with_context(|| format!("Bad certificate PEM in {cert_path}"))?);
    }
    if chain.is_empty() {
        bail!("{cert_path} contains no certificates");
    }

    let file = std::fs::File::open(key_path)
        .with_context(|| format!("Cannot open TLS key {key_path}"))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Bad key PEM in {key_path}"))?
        .with_context(|| format!("{key_path} contains no private key"))?;

    tracing::info!(cert = cert_path, "Using configured TLS certificate");
    Ok((chain, key))
}

/// A fresh self-signed certificate for `localhost` and the loopback
/// addresses, valid for this process only.
fn ephemeral_certificate() -> Result<CertPair> {
    tracing::warn!("No TLS certificate configured, generating a self-signed one for localhost");

    let mut params = CertificateParams::new(vec!["localhost".to_owned()])
        .context("Certificate parameters")?;
    for loopback in [
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ] {
        params.subject_alt_names.push(SanType::IpAddress(loopback));
    }

    let key_pair = KeyPair::generate().context("Key generation")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Certificate signing")?;

    let chain = vec![cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((chain, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_crypto_provider() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    #[test]
    fn ephemeral_acceptor_builds() {
        install_crypto_provider();
        acceptor(None, None).unwrap();
    }

    #[test]
    fn lone_path_falls_back_to_ephemeral() {
        install_crypto_provider();
        // only one of the two paths set means the pair is unusable
        acceptor(Some("/nonexistent/cert.pem"), None).unwrap();
    }

    #[test]
    fn missing_files_are_an_error() {
        let result = acceptor(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem"));
        assert!(result.is_err());
    }
}
