//! Certificate authorities for kestrel
//!
//! Five independent CA roots live in a Vault-compatible secrets backend, one
//! PKI mount each. [`Pki`] issues role-scoped leaf certificates from them for
//! every client/server relationship in the cluster; [`VaultClient`] is the
//! production [`SecretsBackend`].

#![deny(missing_docs)]

pub mod ca;
pub mod cert;
pub mod service_account;
pub mod vault;

pub use ca::{CaKind, Pki, RoleName, SshKeys};
pub use cert::CertificateInfo;
pub use service_account::generate_service_account_key;
pub use vault::{IssueRequest, IssuedCertificate, RolePolicy, SecretsBackend, VaultClient};
