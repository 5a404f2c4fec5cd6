//! Service-account token signing key
//!
//! kube-apiserver signs service-account tokens with this key and
//! kube-controller-manager verifies them. It is generated locally once and
//! kept in storage, not in the secrets backend.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, KeyUsagePurpose};

use kestrel_common::{Error, Result};

/// Generate a self-signed certificate and private key, both PEM
pub fn generate_service_account_key() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "service-account");
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    let key = KeyPair::generate()
        .map_err(|e| Error::internal_with_context("service-account", format!("key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::internal_with_context("service-account", format!("self-signing failed: {e}")))?;
    Ok((cert.pem(), key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertificateInfo;

    #[test]
    fn generated_pair_is_parseable() {
        let (cert, key) = generate_service_account_key().unwrap();
        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(info.common_name, "service-account");
        assert!(key.contains("PRIVATE KEY"));
        KeyPair::from_pem(&key).unwrap();
    }

    #[test]
    fn every_call_yields_a_fresh_key() {
        let (_, a) = generate_service_account_key().unwrap();
        let (_, b) = generate_service_account_key().unwrap();
        assert_ne!(a, b);
    }
}
