//! Secret generators.
//!
//! Each generator produces one [`Artifact`] and writes one file per facet
//! into the device workspace:
//!
//! | Kind | Files |
//! |---|---|
//! | random key, identifier, PIN | `<name>` |
//! | password | `<name>`, `<name>.hash` |
//! | keypair | `<name>`, `<name>.pub` |
//! | certificate | `<name>.key`, `<name>.csr`, `<name>.crt` |
//!
//! Certificates are issued through [`crate::authority::AuthorityCoordinator`];
//! [`SecretGenerator::vpn_credential`] wraps it for tunnel credentials.

use rand::{CryptoRng, RngCore};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::authority::{AuthorityCoordinator, AuthorityRef, CertificateAuthorityStore};
use crate::crypto::{CertificateSubject, CryptoProvider, KeyAlgorithm};
use crate::error::{ProvisionError, ProvisionResult};
use crate::random::{Alphabet, RandomStrings};
use crate::workspace::Workspace;

/// Suffix of the hashed facet of a password artifact.
pub const HASH_SUFFIX: &str = ".hash";

/// Suffix of the public facet of a keypair artifact.
pub const PUBLIC_SUFFIX: &str = ".pub";

/// What kind of secret an artifact holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ArtifactKind {
    /// Alphanumeric key
    RandomKey { length: usize },
    /// Prefixed alphanumeric identifier; `length` excludes the prefix
    Identifier { length: usize, prefix: String },
    /// Alphanumeric password with a crypt hash facet
    Password { length: usize },
    /// Digits only
    Pin { length: usize },
    /// Private key with a public facet
    Keypair {
        algorithm: KeyAlgorithm,
        /// SHA-256 fingerprint, for SSH keys
        #[serde(skip_serializing_if = "Option::is_none")]
        fingerprint: Option<String>,
    },
    /// Leaf certificate signed by a durable authority
    Certificate {
        /// Name of the issuing authority
        authority: String,
        /// Serial drawn from the authority's serial store
        serial: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        ip_address: Option<IpAddr>,
    },
    /// Leaf certificate bound to the device's tunnel address
    VpnCredential {
        authority: String,
        serial: u64,
        ip_address: IpAddr,
    },
}

/// A generated secret and the workspace files holding its facets.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    /// Logical name, also the file name of the primary facet
    pub name: String,
    #[serde(flatten)]
    pub kind: ArtifactKind,
    /// Every file written for this artifact, primary facet first
    pub files: Vec<PathBuf>,
}

/// Writes generated secrets into a device workspace.
pub struct SecretGenerator<'a, P> {
    provider: &'a P,
    strings: RandomStrings,
}

impl<'a, P: CryptoProvider> SecretGenerator<'a, P> {
    pub fn new(provider: &'a P, strings: RandomStrings) -> Self {
        Self { provider, strings }
    }

    /// Alphanumeric key of exactly `length` characters.
    pub fn random_key<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        workspace: &Workspace,
        name: &str,
        length: usize,
    ) -> ProvisionResult<Artifact> {
        let value = self.strings.generate(rng, Alphabet::Alphanumeric, length);
        let path = workspace.write_artifact(name, value.as_bytes())?;
        tracing::info!(artifact = name, length, "Random key generated");

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::RandomKey { length },
            files: vec![path],
        })
    }

    /// `prefix` followed by `length` alphanumeric characters.
    pub fn identifier<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        workspace: &Workspace,
        name: &str,
        prefix: &str,
        length: usize,
    ) -> ProvisionResult<Artifact> {
        let suffix = self.strings.generate(rng, Alphabet::Alphanumeric, length);
        let value = format!("{prefix}{}", suffix.as_str());
        let path = workspace.write_artifact(name, value.as_bytes())?;
        tracing::info!(artifact = name, length, "Identifier generated");

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::Identifier {
                length,
                prefix: prefix.to_string(),
            },
            files: vec![path],
        })
    }

    /// Plaintext password in `<name>` and its crypt hash in `<name>.hash`.
    pub fn password<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        workspace: &Workspace,
        name: &str,
        length: usize,
    ) -> ProvisionResult<Artifact> {
        let value = self.strings.generate(rng, Alphabet::Alphanumeric, length);
        let hash = self.provider.hash_password(&value)?;
        if !self.provider.verify_password(&value, &hash) {
            return Err(ProvisionError::generation(
                name,
                "password hash does not verify",
            ));
        }

        let files = vec![
            workspace.write_artifact(name, value.as_bytes())?,
            workspace.write_artifact(&format!("{name}{HASH_SUFFIX}"), hash.as_bytes())?,
        ];
        tracing::info!(artifact = name, length, "Password generated");

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::Password { length },
            files,
        })
    }

    /// Numeric PIN of exactly `length` digits.
    pub fn pin<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        workspace: &Workspace,
        name: &str,
        length: usize,
    ) -> ProvisionResult<Artifact> {
        let value = self.strings.generate(rng, Alphabet::Digits, length);
        let path = workspace.write_artifact(name, value.as_bytes())?;
        tracing::info!(artifact = name, length, "PIN generated");

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::Pin { length },
            files: vec![path],
        })
    }

    /// Private key in `<name>`, public key in `<name>.pub`.
    pub fn keypair(
        &self,
        workspace: &Workspace,
        name: &str,
        algorithm: KeyAlgorithm,
        comment: &str,
    ) -> ProvisionResult<Artifact> {
        let keypair = self.provider.generate_keypair(algorithm, comment)?;

        let files = vec![
            workspace.write_artifact(name, keypair.private_key.as_bytes())?,
            workspace.write_artifact(
                &format!("{name}{PUBLIC_SUFFIX}"),
                keypair.public_key.as_bytes(),
            )?,
        ];
        tracing::info!(artifact = name, ?algorithm, "Keypair generated");

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::Keypair {
                algorithm,
                fingerprint: keypair.fingerprint,
            },
            files,
        })
    }

    /// Leaf certificate signed by `authority`.
    pub fn certificate<S: CertificateAuthorityStore>(
        &self,
        authorities: &AuthorityCoordinator<S>,
        authority: &AuthorityRef,
        workspace: &Workspace,
        name: &str,
        subject: &CertificateSubject,
    ) -> ProvisionResult<Artifact> {
        authorities.sign_leaf(self.provider, authority, workspace, name, subject)
    }

    /// Tunnel credential: a leaf certificate that must carry the tunnel IP.
    pub fn vpn_credential<S: CertificateAuthorityStore>(
        &self,
        authorities: &AuthorityCoordinator<S>,
        authority: &AuthorityRef,
        workspace: &Workspace,
        name: &str,
        subject: &CertificateSubject,
    ) -> ProvisionResult<Artifact> {
        let ip_address = subject
            .ip_address
            .ok_or(ProvisionError::MissingInput { field: "vpn_ip" })?;

        let artifact = self.certificate(authorities, authority, workspace, name, subject)?;
        let serial = match artifact.kind {
            ArtifactKind::Certificate { serial, .. } => serial,
            _ => return Err(ProvisionError::generation(name, "unexpected artifact kind")),
        };

        Ok(Artifact {
            kind: ArtifactKind::VpnCredential {
                authority: authority.name().to_string(),
                serial,
                ip_address,
            },
            ..artifact
        })
    }
}
