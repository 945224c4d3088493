//! TLS session construction and certificate role extraction.
//!
//! SSNTP runs over mutual TLS. The CA bundle is both the root of trust for
//! outgoing verification and the client-auth trust store on servers. The
//! endpoint certificate file carries the certificate chain and, unless a
//! separate key file is configured, the PEM private key as well.
//!
//! Peer roles are proved by extended-key-usage OIDs under the
//! `1.3.6.1.4.1.343.8` arc; [`certified_role`] maps a peer chain's unknown
//! EKU entries through the role table.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use x509_parser::prelude::*;

use crate::config::Config;
use crate::error::{Result, SsntpError};
use crate::role::Role;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(SsntpError::CertificateInvalid(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the endpoint private key, from the dedicated key file when one is
/// configured and from the certificate file otherwise. Fails closed when
/// neither carries a key.
fn load_key(config: &Config) -> Result<PrivateKeyDer<'static>> {
    let path = config.key.as_deref().unwrap_or(&config.cert);
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        SsntpError::CertificateInvalid(format!("no private key in {}", path.display()))
    })
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| SsntpError::CertificateInvalid(format!("CA bundle: {}", e)))?;
    }
    Ok(roots)
}

/// Build the server-side TLS configuration: client certificates are
/// required and verified against the CA bundle.
pub(crate) fn server_config(config: &Config) -> Result<ServerConfig> {
    let roots = load_roots(&config.ca_cert)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SsntpError::CertificateInvalid(format!("client verifier: {}", e)))?;

    let certs = load_certs(&config.cert)?;
    let key = load_key(config)?;

    Ok(ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?)
}

/// Build the client-side TLS configuration: the server certificate is
/// validated against the CA bundle and our own certificate is presented
/// for client authentication.
pub(crate) fn client_config(config: &Config) -> Result<ClientConfig> {
    let roots = load_roots(&config.ca_cert)?;
    let certs = load_certs(&config.cert)?;
    let key = load_key(config)?;

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?)
}

/// Extract the role bitmask certified by a peer certificate chain.
///
/// Only the leaf certificate is consulted; its unknown extended-key-usage
/// OIDs are mapped through the role table. Returns `Role::UNKNOWN` when the
/// chain carries no role OID.
pub(crate) fn certified_role(chain: &[CertificateDer<'_>]) -> Result<Role> {
    let leaf = chain.first().ok_or_else(|| {
        SsntpError::CertificateInvalid(String::from("peer presented no certificate"))
    })?;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| SsntpError::CertificateInvalid(format!("peer certificate: {}", e)))?;

    Ok(role_from_cert(&cert))
}

/// Parse the endpoint's own certificate file and derive its certified
/// role. Servers call this at startup and refuse to run without a
/// recognized role OID.
pub(crate) fn own_certified_role(cert_path: &Path) -> Result<Role> {
    let data = std::fs::read(cert_path)?;

    for pem in Pem::iter_from_buffer(&data) {
        let pem = pem
            .map_err(|e| SsntpError::CertificateInvalid(format!("{}: {}", cert_path.display(), e)))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| SsntpError::CertificateInvalid(format!("{}: {}", cert_path.display(), e)))?;
        return Ok(role_from_cert(&cert));
    }

    Err(SsntpError::CertificateInvalid(format!(
        "no certificate in {}",
        cert_path.display()
    )))
}

fn role_from_cert(cert: &X509Certificate<'_>) -> Role {
    let mut oids: Vec<String> = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::ExtendedKeyUsage(eku) = ext.parsed_extension() {
            for oid in &eku.other {
                oids.push(oid.to_id_string());
            }
        }
    }
    Role::from_oids(oids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::role_oid_components;
    use rcgen::{Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose};

    fn cert_with_role(role: Role) -> Certificate {
        let mut params = CertificateParams::new(vec![String::from("localhost")]);
        params
            .distinguished_name
            .push(DnType::CommonName, "ssntp test");
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        for oid in role_oid_components(role) {
            params
                .extended_key_usages
                .push(ExtendedKeyUsagePurpose::Other(oid));
        }
        Certificate::from_params(params).unwrap()
    }

    #[test]
    fn test_certified_role_from_der() {
        let cert = cert_with_role(Role::CONTROLLER | Role::AGENT);
        let der = CertificateDer::from(cert.serialize_der().unwrap());

        let role = certified_role(&[der]).unwrap();
        assert_eq!(role, Role::CONTROLLER | Role::AGENT);
    }

    #[test]
    fn test_cert_without_role_oids_is_unknown() {
        let cert = cert_with_role(Role::UNKNOWN);
        let der = CertificateDer::from(cert.serialize_der().unwrap());

        let role = certified_role(&[der]).unwrap();
        assert!(role.is_unknown());
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(certified_role(&[]).is_err());
    }

    #[test]
    fn test_own_certified_role_from_combined_pem() {
        let cert = cert_with_role(Role::SERVER | Role::SCHEDULER);
        let combined = format!(
            "{}{}",
            cert.serialize_pem().unwrap(),
            cert.serialize_private_key_pem()
        );

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.pem");
        std::fs::write(&path, combined).unwrap();

        let role = own_certified_role(&path).unwrap();
        assert_eq!(role, Role::SERVER | Role::SCHEDULER);
    }
}
