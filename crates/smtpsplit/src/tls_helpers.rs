use crate::config::TlsFiles;
use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::sync::Arc;

pub fn make_server_config(files: &TlsFiles) -> anyhow::Result<Arc<ServerConfig>> {
    let certificates = CertificateDer::pem_file_iter(&files.certificate)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("loading certificates from {}", files.certificate.display()))?;
    if certificates.is_empty() {
        anyhow::bail!("no certificates found in {}", files.certificate.display());
    }

    let private_key = PrivateKeyDer::from_pem_file(&files.certificate_key).with_context(|| {
        format!(
            "loading private key from {}",
            files.certificate_key.display()
        )
    })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("building TLS server configuration")?;

    Ok(Arc::new(config))
}
