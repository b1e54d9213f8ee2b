use std::collections::HashSet;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::RealmError;

/// Compute the SHA-256 fingerprint of DER-encoded certificate bytes.
/// Returns a colon-separated uppercase hex string (e.g. "AB:CD:EF:...").
pub fn sha256_fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    hash.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize a configured fingerprint to the form produced by
/// [`sha256_fingerprint`]. Colons are optional, case is ignored.
pub fn parse_fingerprint(input: &str) -> Result<String, RealmError> {
    let hex: String = input.chars().filter(|c| *c != ':').collect();
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RealmError::Configuration(format!(
            "'{input}' is not a SHA-256 certificate fingerprint"
        )));
    }
    let upper = hex.to_ascii_uppercase();
    Ok(upper
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":"))
}

fn load_native_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!("Skipping native certificate source: {}", err);
    }
    let (added, ignored) = store.add_parsable_certificates(loaded.certs);
    debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    store
}

/// Accepts a server certificate whose fingerprint is pinned, otherwise
/// defers to webpki verification against the native roots.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    pinned: HashSet<String>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn new(fingerprints: &[String]) -> Result<Self, RealmError> {
        let pinned = fingerprints
            .iter()
            .map(|f| parse_fingerprint(f))
            .collect::<Result<HashSet<_>, _>>()?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = load_native_root_store();
        let webpki = if roots.is_empty() {
            None
        } else {
            Some(
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| RealmError::Configuration(format!("TLS verifier: {e}")))?,
            )
        };
        if webpki.is_none() && pinned.is_empty() {
            return Err(RealmError::Configuration(
                "no native root certificates and no trusted fingerprints".to_string(),
            ));
        }

        Ok(Self {
            pinned,
            webpki,
            algorithms: provider.signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if self.pinned.contains(&sha256_fingerprint(end_entity.as_ref())) {
            return Ok(ServerCertVerified::assertion());
        }
        match &self.webpki {
            Some(webpki) => {
                webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer)),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build the rustls `ClientConfig` used for LDAPS and StartTLS.
pub fn build_client_config(fingerprints: &[String]) -> Result<Arc<ClientConfig>, RealmError> {
    let verifier = PinnedCertVerifier::new(fingerprints)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RealmError::Configuration(format!("TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str =
        "B9:4D:27:B9:93:4D:3E:08:A5:2E:52:D7:DA:7D:AB:FA:C4:84:EF:E3:7A:53:80:EE:90:88:F7:AC:E2:EF:CD:E9";

    #[test]
    fn test_sha256_fingerprint() {
        assert_eq!(sha256_fingerprint(b"hello world"), HELLO);
    }

    #[test]
    fn test_parse_fingerprint_forms() {
        let bare = HELLO.replace(':', "").to_lowercase();
        assert_eq!(parse_fingerprint(&bare).unwrap(), HELLO);
        assert_eq!(parse_fingerprint(&HELLO.to_lowercase()).unwrap(), HELLO);
        assert!(parse_fingerprint("AB:CD").is_err());
        assert!(parse_fingerprint(&"ZZ".repeat(32)).is_err());
    }

    #[test]
    fn test_build_with_pin() {
        assert!(build_client_config(&[HELLO.to_string()]).is_ok());
        assert!(build_client_config(&["nope".to_string()]).is_err());
    }
}
