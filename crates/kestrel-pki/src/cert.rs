//! Certificate inspection

use x509_parser::prelude::*;

use kestrel_common::{Error, Result};

/// Validity and identity of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organizations
    pub organizations: Vec<String>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// IP subject alternative names
    pub ip_addresses: Vec<String>,
    /// Basic constraints mark this certificate as a CA
    pub is_ca: bool,
}

/// Decode the first PEM block into DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::serialization(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

impl CertificateInfo {
    /// Inspect a PEM certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        Self::from_der(&parse_pem(pem_data)?)
    }

    /// Inspect a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::serialization(format!("failed to parse certificate: {e}")))?;

        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organizations = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Ok(octets) = <[u8; 4]>::try_from(*bytes) {
                            ip_addresses.push(std::net::Ipv4Addr::from(octets).to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .is_some_and(|bc| bc.value.ca);

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organizations,
            dns_names,
            ip_addresses,
            is_ca,
        })
    }

    /// Seconds remaining until the certificate expires
    pub fn remaining_secs(&self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        self.not_after - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair, SanType};

    fn leaf() -> String {
        let mut params = CertificateParams::new(vec!["node1".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "system:node:node1");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "system:nodes");
        params
            .subject_alt_names
            .push(SanType::IpAddress("10.0.0.1".parse().unwrap()));
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn subject_and_sans_are_extracted() {
        let info = CertificateInfo::from_pem(&leaf()).unwrap();
        assert_eq!(info.common_name, "system:node:node1");
        assert_eq!(info.organizations, vec!["system:nodes"]);
        assert_eq!(info.dns_names, vec!["node1"]);
        assert_eq!(info.ip_addresses, vec!["10.0.0.1"]);
        assert!(!info.is_ca);
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CertificateInfo::from_pem("not a pem").is_err());
        let bogus = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(CertificateInfo::from_pem(bogus).is_err());
    }
}
