//! Certificate authorities shared by every provisioned device.
//!
//! Authorities live in the durable secrets root, outside any device
//! workspace, and are created lazily the first time a run needs them:
//!
//! ```text
//! authorities/<name>/
//!     ca.key      private key (0600)
//!     ca.crt      self-signed root (0644)
//!     ca.srl      next serial number, uppercase hex
//!     ca.lock     advisory lock guarding creation and serial allocation
//! ```
//!
//! # State per authority
//!
//! ```text
//! Absent
//!     ↓ (ensure_ca)
//! Created
//! ```
//!
//! `ensure_ca` is idempotent. Leaves may only be signed through an
//! [`AuthorityRef`] obtained from `ensure_ca` on the same coordinator;
//! anything else is a [`ProvisionError::CaContractViolation`].

use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::crypto::{CertificateSubject, CertifiedKey, CryptoProvider};
use crate::error::{ProvisionError, ProvisionResult};
use crate::secrets::{Artifact, ArtifactKind};
use crate::workspace::{
    create_private_dir_all, validate_artifact_name, write_atomic, Layout, Workspace,
    PRIVATE_MODE, PUBLIC_MODE,
};

pub const CA_KEY: &str = "ca.key";
pub const CA_CERT: &str = "ca.crt";
pub const CA_SERIAL: &str = "ca.srl";
pub const CA_LOCK: &str = "ca.lock";

/// Serial of the first leaf signed by a fresh authority.
pub const FIRST_SERIAL: u64 = 1;

/// Lifecycle state of a certificate authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityState {
    Absent,
    Created,
}

/// Persistent storage for certificate authorities.
pub trait CertificateAuthorityStore {
    /// Load an authority, `None` when it was never created.
    fn load(&self, name: &str) -> ProvisionResult<Option<CertifiedKey>>;

    /// Load an authority or store the one returned by `create`.
    ///
    /// The check and the creation are atomic with respect to other callers
    /// of the same store. Returns the stored material and whether it was
    /// created by this call.
    fn load_or_create(
        &self,
        name: &str,
        create: &mut dyn FnMut() -> ProvisionResult<CertifiedKey>,
    ) -> ProvisionResult<(CertifiedKey, bool)>;

    /// Allocate the next serial number. Never returns the same value twice
    /// for one authority.
    fn next_serial(&self, name: &str) -> ProvisionResult<u64>;
}

/// Filesystem backed [`CertificateAuthorityStore`].
#[derive(Debug, Clone)]
pub struct FsAuthorityStore {
    root: PathBuf,
}

impl FsAuthorityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_layout(layout: &Layout) -> Self {
        Self::new(layout.authorities_dir())
    }

    pub fn authority_dir(&self, name: &str) -> ProvisionResult<PathBuf> {
        validate_artifact_name(name)?;
        Ok(self.root.join(name))
    }

    /// Exclusive lock held until the returned file is dropped.
    fn lock(&self, dir: &Path) -> io::Result<File> {
        create_private_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(CA_LOCK))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_material(dir: &Path) -> io::Result<Option<CertifiedKey>> {
        let key_pem = match std::fs::read_to_string(dir.join(CA_KEY)) {
            Ok(key) => Zeroizing::new(key),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        // a key without a certificate is an interrupted creation
        let certificate_pem = match std::fs::read_to_string(dir.join(CA_CERT)) {
            Ok(cert) => cert,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(CertifiedKey {
            key_pem,
            certificate_pem,
        }))
    }
}

impl CertificateAuthorityStore for FsAuthorityStore {
    fn load(&self, name: &str) -> ProvisionResult<Option<CertifiedKey>> {
        let dir = self.authority_dir(name)?;
        Ok(Self::read_material(&dir)?)
    }

    fn load_or_create(
        &self,
        name: &str,
        create: &mut dyn FnMut() -> ProvisionResult<CertifiedKey>,
    ) -> ProvisionResult<(CertifiedKey, bool)> {
        let dir = self.authority_dir(name)?;
        let _lock = self.lock(&dir)?;

        if let Some(material) = Self::read_material(&dir)? {
            return Ok((material, false));
        }

        let material = create()?;
        write_atomic(&dir.join(CA_KEY), material.key_pem.as_bytes(), PRIVATE_MODE, true)?;
        write_atomic(
            &dir.join(CA_CERT),
            material.certificate_pem.as_bytes(),
            PUBLIC_MODE,
            true,
        )?;

        Ok((material, true))
    }

    fn next_serial(&self, name: &str) -> ProvisionResult<u64> {
        let dir = self.authority_dir(name)?;
        let _lock = self.lock(&dir)?;
        let path = dir.join(CA_SERIAL);

        let serial = match std::fs::read_to_string(&path) {
            Ok(content) => u64::from_str_radix(content.trim(), 16).map_err(|e| {
                ProvisionError::generation(
                    format!("serial for {name}"),
                    format!("corrupt {}: {e}", path.display()),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => FIRST_SERIAL,
            Err(e) => return Err(e.into()),
        };

        let next = serial.checked_add(1).ok_or_else(|| {
            ProvisionError::generation(format!("serial for {name}"), "serial space exhausted")
        })?;
        write_atomic(&path, format!("{next:02X}\n").as_bytes(), PRIVATE_MODE, true)?;

        Ok(serial)
    }
}

/// Handle to an authority ensured by an [`AuthorityCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityRef {
    name: String,
    created: bool,
}

impl AuthorityRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `ensure_ca` created the authority instead of reusing it.
    pub fn was_created(&self) -> bool {
        self.created
    }
}

/// Ensures authorities exist and signs device leaves against them.
pub struct AuthorityCoordinator<S> {
    store: S,
    ensured: HashMap<String, CertifiedKey>,
}

impl<S: CertificateAuthorityStore> AuthorityCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            ensured: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn state(&self, name: &str) -> ProvisionResult<AuthorityState> {
        if self.ensured.contains_key(name) {
            return Ok(AuthorityState::Created);
        }
        Ok(match self.store.load(name)? {
            Some(_) => AuthorityState::Created,
            None => AuthorityState::Absent,
        })
    }

    /// Make sure the authority `name` exists, creating a self-signed root
    /// for `subject` when it does not. Existing authorities are never
    /// modified.
    pub fn ensure_ca<P: CryptoProvider>(
        &mut self,
        provider: &P,
        name: &str,
        subject: &CertificateSubject,
    ) -> ProvisionResult<AuthorityRef> {
        let (material, created) = self
            .store
            .load_or_create(name, &mut || provider.create_self_signed_certificate(subject))?;

        if created {
            tracing::info!(
                authority = name,
                common_name = %subject.common_name,
                "Certificate authority created"
            );
        } else {
            tracing::debug!(authority = name, "Certificate authority reused");
        }

        self.ensured.insert(name.to_string(), material);
        Ok(AuthorityRef {
            name: name.to_string(),
            created,
        })
    }

    /// Root certificate of an ensured authority.
    pub fn certificate_pem(&self, authority: &AuthorityRef) -> ProvisionResult<&str> {
        Ok(&self.material(authority)?.certificate_pem)
    }

    /// Issue a leaf for `subject` into `workspace` as `<name>.key`,
    /// `<name>.csr` and `<name>.crt`.
    pub fn sign_leaf<P: CryptoProvider>(
        &self,
        provider: &P,
        authority: &AuthorityRef,
        workspace: &Workspace,
        name: &str,
        subject: &CertificateSubject,
    ) -> ProvisionResult<Artifact> {
        let issuer = self.material(authority)?;
        validate_artifact_name(name)?;

        let serial = self.store.next_serial(authority.name())?;
        let leaf = provider.create_and_sign_certificate(issuer, subject, serial)?;

        let files = vec![
            workspace.write_artifact(&format!("{name}.key"), leaf.key_pem.as_bytes())?,
            workspace.write_artifact(&format!("{name}.csr"), leaf.csr_pem.as_bytes())?,
            workspace.write_artifact(&format!("{name}.crt"), leaf.certificate_pem.as_bytes())?,
        ];

        tracing::info!(
            artifact = name,
            authority = authority.name(),
            serial,
            "Leaf certificate signed"
        );

        Ok(Artifact {
            name: name.to_string(),
            kind: ArtifactKind::Certificate {
                authority: authority.name().to_string(),
                serial,
                ip_address: subject.ip_address,
            },
            files,
        })
    }

    fn material(&self, authority: &AuthorityRef) -> ProvisionResult<&CertifiedKey> {
        self.ensured.get(authority.name()).ok_or_else(|| {
            tracing::error!(
                authority = authority.name(),
                "Signing against an authority that was not ensured"
            );
            ProvisionError::CaContractViolation {
                authority: authority.name().to_string(),
            }
        })
    }
}
