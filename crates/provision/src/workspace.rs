//! Device identities and the on-disk workspace layout.
//!
//! ```text
//! <secrets_root>/
//!     devices/<device_id>/      per-device workspace (0700)
//!     authorities/<name>/       durable certificate authorities
//! <staging_dir>/                hand-off mirror, wiped every run
//! <publish_dir>/<device_id>/secrets.age
//! ```
//!
//! A workspace is created exactly once per device id. Allocation never
//! reuses or overwrites an existing directory; a workspace left behind by a
//! failed run must be deleted by an operator before its id can be reused.

use rand::{CryptoRng, RngCore};
use serde::{Serialize, Serializer};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pidgeon_core::config::is_valid_file_name;
use pidgeon_core::PathsConfig;

use crate::error::{ProvisionError, ProvisionResult};

pub use pidgeon_core::config::{AUTHORITIES_DIR, DEVICES_DIR};

/// File name of the encrypted bundle inside the publish directory.
pub const PUBLISHED_BUNDLE: &str = "secrets.age";

/// Permissions of private artifact files.
pub const PRIVATE_MODE: u32 = 0o600;

/// Permissions of public artifact files such as CA certificates.
pub const PUBLIC_MODE: u32 = 0o644;

const DEVICE_ID_BYTES: usize = 16;

/// Random 128-bit identity of one provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_BYTES]);

impl DeviceId {
    /// Draw a fresh identity from the given entropy source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; DEVICE_ID_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for DeviceId {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; DEVICE_ID_BYTES];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ProvisionError::InvalidDeviceId(format!("{s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Resolved filesystem locations for provisioning.
#[derive(Debug, Clone)]
pub struct Layout {
    secrets_root: PathBuf,
    staging_dir: PathBuf,
    publish_dir: PathBuf,
}

impl Layout {
    pub fn new(
        secrets_root: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        publish_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            secrets_root: secrets_root.into(),
            staging_dir: staging_dir.into(),
            publish_dir: publish_dir.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.secrets_root, &paths.staging_dir, &paths.publish_dir)
    }

    pub fn secrets_root(&self) -> &Path {
        &self.secrets_root
    }

    pub fn devices_dir(&self) -> PathBuf {
        self.secrets_root.join(DEVICES_DIR)
    }

    pub fn device_dir(&self, device_id: &DeviceId) -> PathBuf {
        self.devices_dir().join(device_id.to_string())
    }

    pub fn authorities_dir(&self) -> PathBuf {
        self.secrets_root.join(AUTHORITIES_DIR)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Deterministic location of a device's encrypted bundle.
    pub fn publish_path(&self, device_id: &DeviceId) -> PathBuf {
        self.publish_dir
            .join(device_id.to_string())
            .join(PUBLISHED_BUNDLE)
    }

    /// Wipe and recreate the staging directory.
    ///
    /// The staging directory only ever holds copies. Callers are expected to
    /// have checked the paths with [`PathsConfig::validate`].
    pub fn reset_staging(&self) -> ProvisionResult<()> {
        match std::fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        create_private_dir_all(&self.staging_dir)?;
        tracing::debug!(path = %self.staging_dir.display(), "Staging directory reset");
        Ok(())
    }
}

/// Per-device directory holding every artifact of one provisioning run.
#[derive(Debug, Clone)]
pub struct Workspace {
    device_id: DeviceId,
    dir: PathBuf,
}

impl Workspace {
    /// Allocate a workspace for a freshly generated device id.
    pub fn allocate<R: RngCore + CryptoRng>(layout: &Layout, rng: &mut R) -> ProvisionResult<Self> {
        Self::allocate_with(layout, DeviceId::generate(rng))
    }

    /// Allocate a workspace for a given device id.
    ///
    /// Fails with [`ProvisionError::IdentityCollision`] when the workspace
    /// already exists; the existing directory is left untouched.
    pub fn allocate_with(layout: &Layout, device_id: DeviceId) -> ProvisionResult<Self> {
        let dir = layout.device_dir(&device_id);
        create_private_dir_all(&layout.devices_dir())?;

        match create_private_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ProvisionError::IdentityCollision {
                    device_id: device_id.to_string(),
                    path: dir,
                });
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(device_id = %device_id, path = %dir.display(), "Workspace allocated");
        Ok(Self { device_id, dir })
    }

    /// Open the workspace of an already provisioned device.
    pub fn open(layout: &Layout, device_id: DeviceId) -> ProvisionResult<Self> {
        let dir = layout.device_dir(&device_id);
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no workspace at {}", dir.display()),
            )
            .into());
        }
        Ok(Self { device_id, dir })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, name: &str) -> ProvisionResult<PathBuf> {
        validate_artifact_name(name)?;
        Ok(self.dir.join(name))
    }

    pub fn has_artifact(&self, name: &str) -> bool {
        self.artifact_path(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Atomically write a new private artifact; existing files are never
    /// replaced.
    pub fn write_artifact(&self, name: &str, contents: &[u8]) -> ProvisionResult<PathBuf> {
        let path = self.artifact_path(name)?;
        write_atomic(&path, contents, PRIVATE_MODE, false)
            .map_err(|e| ProvisionError::generation(name, e))?;
        tracing::debug!(artifact = name, "Artifact written");
        Ok(path)
    }

    pub fn read_artifact(&self, name: &str) -> ProvisionResult<String> {
        let path = self.artifact_path(name)?;
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Artifact names become file names: `[A-Za-z0-9._-]`, no leading dot.
pub fn validate_artifact_name(name: &str) -> ProvisionResult<()> {
    if is_valid_file_name(name) {
        Ok(())
    } else {
        Err(ProvisionError::generation(name, "invalid artifact name"))
    }
}

/// Write `contents` to `path` through a temporary file in the same directory.
///
/// Readers either see the previous state or the complete file, never a
/// partial one. With `overwrite == false` an existing target is an error.
pub(crate) fn write_atomic(
    path: &Path,
    contents: &[u8],
    mode: u32,
    overwrite: bool,
) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent")
    })?;

    let mut file = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    if overwrite {
        file.persist(path).map_err(|e| e.error)?;
    } else {
        file.persist_noclobber(path).map_err(|e| e.error)?;
    }
    Ok(())
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().mode(0o700).create(path)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir(path)
    }
}

pub(crate) fn create_private_dir_all(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layout(root: &Path) -> Layout {
        Layout::new(root.join("secrets"), root.join("staging"), root.join("enc"))
    }

    #[test]
    fn test_device_id_is_32_hex_chars() {
        let id = DeviceId::generate(&mut StdRng::seed_from_u64(1));
        let rendered = id.to_string();

        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rendered.parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn test_device_id_rejects_bad_input() {
        assert!("abc".parse::<DeviceId>().is_err());
        assert!("zz".repeat(16).parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_allocate_creates_workspace() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());

        let workspace = Workspace::allocate(&layout, &mut StdRng::seed_from_u64(7)).unwrap();

        assert!(workspace.path().is_dir());
        assert_eq!(workspace.path(), layout.device_dir(workspace.device_id()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(workspace.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_allocate_collision_leaves_existing_workspace() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());

        let first = Workspace::allocate(&layout, &mut StdRng::seed_from_u64(42)).unwrap();
        first.write_artifact("api.key", b"original").unwrap();

        let result = Workspace::allocate(&layout, &mut StdRng::seed_from_u64(42));
        assert!(matches!(result, Err(ProvisionError::IdentityCollision { .. })));

        assert_eq!(first.read_artifact("api.key").unwrap(), "original");
        let entries = std::fs::read_dir(first.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_different_seeds_do_not_collide() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());

        let mut rng = StdRng::seed_from_u64(3);
        let a = Workspace::allocate(&layout, &mut rng).unwrap();
        let b = Workspace::allocate(&layout, &mut rng).unwrap();
        assert_ne!(a.device_id(), b.device_id());
    }

    #[test]
    fn test_write_artifact_never_clobbers() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());
        let workspace = Workspace::allocate(&layout, &mut StdRng::seed_from_u64(9)).unwrap();

        workspace.write_artifact("wifi.pass", b"first").unwrap();
        let result = workspace.write_artifact("wifi.pass", b"second");

        assert!(matches!(result, Err(ProvisionError::GenerationFailure { .. })));
        assert_eq!(workspace.read_artifact("wifi.pass").unwrap(), "first");
    }

    #[test]
    fn test_write_artifact_is_private() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());
        let workspace = Workspace::allocate(&layout, &mut StdRng::seed_from_u64(10)).unwrap();

        let path = workspace.write_artifact("admin.pass", b"secret").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, PRIVATE_MODE);
        }
        assert!(path.is_file());
    }

    #[test]
    fn test_artifact_names_are_validated() {
        assert!(validate_artifact_name("postgres.crt").is_ok());
        assert!(validate_artifact_name("postgres-pidgeon.pass").is_ok());
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name(".hidden").is_err());
        assert!(validate_artifact_name("../escape").is_err());
        assert!(validate_artifact_name("with space").is_err());
    }

    #[test]
    fn test_reset_staging_wipes_contents() {
        let temp = tempfile::tempdir().unwrap();
        let layout = layout(temp.path());

        layout.reset_staging().unwrap();
        std::fs::write(layout.staging_dir().join("stale"), "old").unwrap();

        layout.reset_staging().unwrap();
        assert!(layout.staging_dir().is_dir());
        assert_eq!(std::fs::read_dir(layout.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_publish_path_is_deterministic() {
        let layout = Layout::new("secrets", "staging", "enc");
        let id: DeviceId = "00112233445566778899aabbccddeeff".parse().unwrap();

        assert_eq!(
            layout.publish_path(&id),
            PathBuf::from("enc/00112233445566778899aabbccddeeff/secrets.age")
        );
    }
}
