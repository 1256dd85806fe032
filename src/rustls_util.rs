use std::sync::Arc;
use std::sync::OnceLock;

use rustls::client::{EchConfig, EchMode, WebPkiServerVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, EchConfigListBytes, PrivateKeyDer};

fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

fn get_root_cert_store() -> Arc<rustls::RootCertStore> {
    static INSTANCE: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let root_store = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(root_store)
        })
        .clone()
}

/// Build a client config that offers ECH with the given config list and
/// fails the handshake if the server does not honor it. ECH forces TLS 1.3;
/// there is no cleartext-SNI fallback path.
pub fn create_ech_client_config(
    ech_config_list: Vec<u8>,
) -> std::io::Result<rustls::ClientConfig> {
    let ech_config = EchConfig::new(
        EchConfigListBytes::from(ech_config_list),
        rustls::crypto::aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
    )
    .map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid ECH config list: {}", e),
        )
    })?;

    let verifier = WebPkiServerVerifier::builder_with_provider(
        get_root_cert_store(),
        get_crypto_provider(),
    )
    .build()
    .map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to build certificate verifier: {}", e),
        )
    })?;

    let config = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_ech(EchMode::from(ech_config))
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to enable ECH: {}", e),
            )
        })?
        .with_webpki_verifier(verifier)
        .with_no_client_auth();

    Ok(config)
}

/// Build a TLS-1.3-minimum server config from PEM cert chain and key bytes.
pub fn create_server_config(
    cert_bytes: &[u8],
    key_bytes: &[u8],
) -> std::io::Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_slice_iter(cert_bytes)
        .map(|r| r.map(|c| c.into_owned()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse certificate PEM: {:?}", e),
            )
        })?;
    if certs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "No certificates found in PEM",
        ));
    }

    let privkey = PrivateKeyDer::from_pem_slice(key_bytes).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse private key PEM: {:?}", e),
        )
    })?;

    let config = rustls::ServerConfig::builder_with_provider(get_crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to select TLS 1.3: {}", e),
            )
        })?
        .with_no_client_auth()
        .with_single_cert(certs, privkey)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Bad certificate or key: {}", e),
            )
        })?;

    Ok(config)
}

/// Generate a self-signed certificate for servers started without cert/key
/// files. Returns (cert PEM, key PEM).
pub fn generate_self_signed_pem(hostname: &str) -> std::io::Result<(String, String)> {
    // IPv6 listen hosts arrive bracketed; rcgen wants the bare address.
    let stripped = hostname.trim_start_matches('[').trim_end_matches(']');
    let name = if stripped.is_empty() {
        "localhost".to_string()
    } else {
        stripped.to_string()
    };
    let certified = rcgen::generate_simple_self_signed(vec![name]).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to generate self-signed certificate: {}", e),
        )
    })?;
    Ok((
        certified.cert.pem(),
        certified.key_pair.serialize_pem(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_roundtrip() {
        let (cert_pem, key_pem) = generate_self_signed_pem("gateway.example").unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        let config = create_server_config(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_server_config_rejects_garbage() {
        assert!(create_server_config(b"not pem", b"not pem").is_err());
    }
}
