//! Shared rustls client configurations for the two verification regimes.

use std::sync::Arc;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, OwnedTrustAnchor, RootCertStore, ServerName};

static STRICT_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

static RELAXED_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    Arc::new(
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth(),
    )
});

/// Certificate verifier for the relaxed regime: the handshake still has to
/// complete, only the chain and name checks are waived.
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Client config for the given regime; strict validates against the webpki
/// root set, relaxed accepts any presented certificate.
pub fn client_config(strict: bool) -> Arc<ClientConfig> {
    if strict {
        Arc::clone(&STRICT_CONFIG)
    } else {
        Arc::clone(&RELAXED_CONFIG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configs_build() {
        let strict = client_config(true);
        let relaxed = client_config(false);
        assert!(!Arc::ptr_eq(&strict, &relaxed));
        // Cached instances are reused.
        assert!(Arc::ptr_eq(&strict, &client_config(true)));
    }
}
