//! Device secrets provisioning for Pidgeon gateways.
//!
//! A provisioning run gives a new device a random identity and a private
//! workspace, fills the workspace with every credential the device needs,
//! signs its certificates with durable shared authorities, and publishes
//! the device's bundle encrypted to the device's own age key.
//!
//! # Core Concepts
//!
//! - **Workspace**: per-device directory written exactly once
//! - **Artifact**: one generated secret, stored as one file per facet
//! - **Authority**: self-signed CA shared by all devices, created lazily
//! - **Bundle**: `secrets.yaml`, the files the device needs at runtime
//! - **Staging**: best-effort copies of selected artifacts for hand-off
//!
//! # Example
//!
//! ```no_run
//! use pidgeon_core::Config;
//! use pidgeon_provision::{ProvisionRequest, Provisioner};
//! use rand::rngs::OsRng;
//!
//! let mut provisioner = Provisioner::from_config(Config::default());
//! let request = ProvisionRequest {
//!     cloud_domain: "example.com".to_string(),
//!     ip_range_start: "10.0.0.1".to_string(),
//!     ip_range_end: "10.0.0.254".to_string(),
//!     vpn_ip: "10.255.255.2".to_string(),
//! };
//! let report = provisioner.run(&request, &mut OsRng)?;
//! println!("{}", report.device_id);
//! # Ok::<(), pidgeon_provision::ProvisionError>(())
//! ```

pub mod authority;
pub mod bundle;
pub mod crypto;
pub mod error;
pub mod provisioner;
pub mod publish;
pub mod random;
pub mod secrets;
pub mod staging;
pub mod workspace;

pub use authority::{
    AuthorityCoordinator, AuthorityRef, AuthorityState, CertificateAuthorityStore,
    FsAuthorityStore,
};
pub use crypto::{
    CertificateSubject, CertifiedKey, CryptoProvider, KeyAlgorithm, NativeCryptoProvider,
};
pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{ProvisionReport, ProvisionRequest, Provisioner};
pub use publish::Published;
pub use random::{Alphabet, RandomStrings};
pub use secrets::{Artifact, ArtifactKind, SecretGenerator};
pub use staging::{MirrorWarning, StagingExporter};
pub use workspace::{DeviceId, Layout, Workspace};
