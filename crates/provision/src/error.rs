//! Error types for Pidgeon provisioning operations.
//!
//! Every variant except I/O passthrough corresponds to one failure class of a
//! provisioning run. All of them are fatal: the run stops and the partially
//! populated workspace stays on disk for inspection. Staging failures are not
//! errors; see [`crate::staging::MirrorWarning`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while provisioning a device.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The device id was already provisioned
    #[error("Device {device_id} already has a workspace at {}", path.display())]
    IdentityCollision { device_id: String, path: PathBuf },

    /// Device id is not 32 hex characters
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    /// Required input absent or empty
    #[error("Missing required input: {field}")]
    MissingInput { field: &'static str },

    /// An artifact could not be generated
    #[error("Failed generating {artifact}: {reason}")]
    GenerationFailure { artifact: String, reason: String },

    /// Signing was attempted against an authority that was never ensured
    #[error("Certificate authority {authority} was not ensured before signing")]
    CaContractViolation { authority: String },

    /// The bundle could not be encrypted, decrypted or published
    #[error("Encryption error: {0}")]
    EncryptionError(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core errors
    #[error("Core error: {0}")]
    Core(#[from] pidgeon_core::CoreError),
}

impl ProvisionError {
    pub(crate) fn generation(artifact: impl Into<String>, reason: impl ToString) -> Self {
        Self::GenerationFailure {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;
