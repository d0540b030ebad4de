//! Encryption and publication of the provisioning bundle.
//!
//! The bundle is encrypted with age to the device's own x25519 recipient and
//! ASCII armored. Only the ciphertext ever leaves the secrets root.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{ProvisionError, ProvisionResult};
use crate::workspace::{write_atomic, PUBLIC_MODE};

/// Where a bundle was published and the BLAKE3 digest of its ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    /// `<publish_dir>/<device_id>/secrets.age`
    pub path: PathBuf,
    /// Hex BLAKE3 digest of the armored ciphertext
    pub digest: String,
}

/// Encrypt `bundle` to the age `recipient` (`age1...`).
pub fn encrypt(bundle: &str, recipient: &str) -> ProvisionResult<String> {
    let recipient = recipient.trim();
    if recipient.is_empty() {
        return Err(ProvisionError::EncryptionError(
            "missing age recipient".to_string(),
        ));
    }

    let recipient: age::x25519::Recipient = recipient.parse().map_err(|e| {
        ProvisionError::EncryptionError(format!("malformed age recipient: {e}"))
    })?;

    age::encrypt_and_armor(&recipient, bundle.as_bytes())
        .map_err(|e| ProvisionError::EncryptionError(e.to_string()))
}

/// Decrypt an armored bundle with the age `identity` (`AGE-SECRET-KEY-1...`).
pub fn decrypt(ciphertext: &str, identity: &str) -> ProvisionResult<Zeroizing<String>> {
    let identity: age::x25519::Identity = identity.trim().parse().map_err(|e| {
        ProvisionError::EncryptionError(format!("malformed age identity: {e}"))
    })?;

    let plaintext = age::decrypt(&identity, ciphertext.as_bytes())
        .map_err(|e| ProvisionError::EncryptionError(e.to_string()))?;

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| ProvisionError::EncryptionError("bundle is not valid UTF-8".to_string()))
}

/// Write `ciphertext` to `destination`, refusing to replace an existing
/// publication.
pub fn publish(ciphertext: &str, destination: &Path) -> ProvisionResult<Published> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    write_atomic(destination, ciphertext.as_bytes(), PUBLIC_MODE, false).map_err(|e| {
        if e.kind() == io::ErrorKind::AlreadyExists {
            ProvisionError::EncryptionError(format!(
                "{} is already published",
                destination.display()
            ))
        } else {
            ProvisionError::Io(e)
        }
    })?;

    let digest = blake3::hash(ciphertext.as_bytes()).to_hex().to_string();
    tracing::info!(path = %destination.display(), digest = %digest, "Bundle published");

    Ok(Published {
        path: destination.to_path_buf(),
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, KeyAlgorithm, NativeCryptoProvider};

    fn keypair() -> (String, String) {
        let keypair = NativeCryptoProvider::default()
            .generate_keypair(KeyAlgorithm::Age, "")
            .unwrap();
        (keypair.private_key.to_string(), keypair.public_key)
    }

    #[test]
    fn test_encrypt_decrypt() {
        let (identity, recipient) = keypair();
        let bundle = "api.key: |2-\n  abc\n";

        let ciphertext = encrypt(bundle, &recipient).unwrap();
        assert!(ciphertext.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
        assert!(!ciphertext.contains("abc"));

        assert_eq!(decrypt(&ciphertext, &identity).unwrap().as_str(), bundle);
    }

    #[test]
    fn test_wrong_identity_cannot_decrypt() {
        let (_, recipient) = keypair();
        let (other, _) = keypair();

        let ciphertext = encrypt("secret", &recipient).unwrap();
        assert!(matches!(
            decrypt(&ciphertext, &other),
            Err(ProvisionError::EncryptionError(_))
        ));
    }

    #[test]
    fn test_bad_recipients() {
        assert!(matches!(encrypt("x", ""), Err(ProvisionError::EncryptionError(_))));
        assert!(matches!(encrypt("x", "  \n"), Err(ProvisionError::EncryptionError(_))));
        assert!(matches!(
            encrypt("x", "age1notarecipient"),
            Err(ProvisionError::EncryptionError(_))
        ));
    }

    #[test]
    fn test_publish_refuses_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let destination = temp.path().join("enc").join("device").join("secrets.age");

        let published = publish("first", &destination).unwrap();
        assert_eq!(published.path, destination);
        assert_eq!(published.digest, blake3::hash(b"first").to_hex().to_string());

        let again = publish("second", &destination);
        assert!(matches!(again, Err(ProvisionError::EncryptionError(_))));
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "first");
    }
}
