//! TLS client setup
//!
//! Loads the device certificate, its private key and the broker's root CA
//! from PEM files and builds a connector for mutually authenticated sessions.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::MqttSettings;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        TlsError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_reader(open(path)?)
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();

    for cert in load_certs(path)? {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }

    Ok(root_store)
}

/// Build a connector presenting the client certificate to the broker
pub fn build_connector(settings: &MqttSettings) -> Result<TlsConnector, TlsError> {
    let (cert_path, key_path, ca_path) = match (
        settings.cert_path.as_deref(),
        settings.key_path.as_deref(),
        settings.root_ca_path.as_deref(),
    ) {
        (Some(cert), Some(key), Some(ca)) => (cert, key, ca),
        _ => {
            return Err(TlsError::ConfigError(
                "certificate, private key and root CA are required for TLS".to_string(),
            ))
        }
    };

    let root_store = load_ca_certs(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?;

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Name the broker certificate is verified against
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TlsError::ConfigError(format!("Invalid server name '{}': {}", host, e)))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_tls_error_display() {
        let err = TlsError::CertificateError("test error".to_string());
        assert!(err.to_string().contains("Certificate error"));

        let err = TlsError::PrivateKeyError("key error".to_string());
        assert!(err.to_string().contains("Private key error"));

        let err = TlsError::ConfigError("config error".to_string());
        assert!(err.to_string().contains("TLS config error"));
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = load_certs(Path::new("/nonexistent/device.pem.crt")).unwrap_err();
        assert!(matches!(err, TlsError::Io(_)));
        assert!(err.to_string().contains("/nonexistent/device.pem.crt"));
    }

    #[test]
    fn test_pem_without_certificates() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        assert!(matches!(
            load_certs(file.path()),
            Err(TlsError::CertificateError(_))
        ));
    }

    #[test]
    fn test_connector_requires_all_material() {
        let mut settings = MqttSettings::new("broker.example.com", 8883, "device");
        settings.cert_path = Some(PathBuf::from("device.pem.crt"));

        assert!(matches!(
            build_connector(&settings),
            Err(TlsError::ConfigError(_))
        ));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("abc123-ats.iot.eu-central-1.amazonaws.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
