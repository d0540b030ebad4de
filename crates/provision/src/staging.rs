//! Staging mirror of selected artifacts for the operator hand-off.
//!
//! The staging directory is wiped at the start of every run and only ever
//! receives copies. Mirroring is best effort: a failure becomes a
//! [`MirrorWarning`] and never aborts provisioning.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::workspace::{validate_artifact_name, write_atomic, PRIVATE_MODE};

/// A non-fatal failure to mirror an artifact.
#[derive(Debug, Clone, Error, Serialize)]
#[error("Failed mirroring {name}: {reason}")]
pub struct MirrorWarning {
    /// Artifact, or the staging directory itself when the reset failed
    pub name: String,
    /// Underlying error message
    pub reason: String,
}

/// Copies artifacts into the staging directory.
#[derive(Debug, Clone)]
pub struct StagingExporter {
    dir: PathBuf,
    mirrored: Vec<String>,
}

impl StagingExporter {
    /// Exporter copying the artifacts named in `mirrored` into `dir`.
    pub fn new(dir: impl Into<PathBuf>, mirrored: impl IntoIterator<Item = String>) -> Self {
        Self {
            dir: dir.into(),
            mirrored: mirrored.into_iter().collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_mirrored(&self, name: &str) -> bool {
        self.mirrored.iter().any(|mirrored| mirrored == name)
    }

    /// Write `content` to `<staging>/<name>`, replacing any previous copy.
    pub fn mirror(&self, name: &str, content: &[u8]) -> Result<(), MirrorWarning> {
        let warning = |reason: String| MirrorWarning {
            name: name.to_string(),
            reason,
        };

        validate_artifact_name(name).map_err(|e| warning(e.to_string()))?;
        write_atomic(&self.dir.join(name), content, PRIVATE_MODE, true)
            .map_err(|e| warning(e.to_string()))?;

        tracing::debug!(artifact = name, "Artifact mirrored to staging");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter(dir: &Path) -> StagingExporter {
        StagingExporter::new(dir, ["id", "wifi.pass"].map(String::from))
    }

    #[test]
    fn test_mirror_writes_copy() {
        let temp = tempfile::tempdir().unwrap();
        let exporter = exporter(temp.path());

        exporter.mirror("id", b"abc").unwrap();
        exporter.mirror("id", b"def").unwrap();

        assert_eq!(std::fs::read_to_string(temp.path().join("id")).unwrap(), "def");
    }

    #[test]
    fn test_missing_staging_dir_is_a_warning() {
        let temp = tempfile::tempdir().unwrap();
        let exporter = exporter(&temp.path().join("gone"));

        let warning = exporter.mirror("id", b"abc").unwrap_err();
        assert_eq!(warning.name, "id");
        assert!(!warning.reason.is_empty());
    }

    #[test]
    fn test_mirrored_set() {
        let temp = tempfile::tempdir().unwrap();
        let exporter = exporter(temp.path());

        assert!(exporter.is_mirrored("wifi.pass"));
        assert!(!exporter.is_mirrored("api.key"));
        assert_eq!(exporter.dir(), temp.path());
    }

    #[test]
    fn test_invalid_name_is_a_warning() {
        let temp = tempfile::tempdir().unwrap();
        let warning = exporter(temp.path()).mirror("../id", b"abc").unwrap_err();

        assert_eq!(warning.name, "../id");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
