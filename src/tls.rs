use anyhow::{Context, Result, anyhow};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};

/// Builds the server config a frontend uses to terminate client TLS.
///
/// Errors name the offending file; callers add which frontend it belongs to.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let cert_chain = read_cert_chain(cert_path)?;
    let private_key = read_private_key(key_path)?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map(Arc::new)
        .with_context(|| {
            format!(
                "Failed to build TLS config from {} and {}",
                cert_path.display(),
                key_path.display()
            )
        })
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open {what} file: {}", path.display()))
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut open(path, "certificate")?)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))?;
    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path, "private key")?)
        .with_context(|| format!("Failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
}
