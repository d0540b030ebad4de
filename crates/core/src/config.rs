//! Configuration management for Pidgeon provisioning.
//!
//! Every section is optional in the TOML file; missing values fall back to
//! the defaults below, which reproduce the layout the deployment tree
//! expects.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Subdirectory of the secrets root holding device workspaces.
pub const DEVICES_DIR: &str = "devices";

/// Subdirectory of the secrets root holding certificate authorities.
pub const AUTHORITIES_DIR: &str = "authorities";

/// Names that end up as file names: `[A-Za-z0-9._-]`, no leading dot.
pub fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub secrets: SecretsConfig,
    pub database: DatabaseConfig,
    pub cloud: CloudConfig,
    pub authorities: AuthoritiesConfig,
    pub bundle: BundleConfig,
    pub staging: StagingConfig,
}

/// Filesystem locations used by a provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Durable secrets root holding device workspaces and authorities
    pub secrets_root: PathBuf,
    /// Transient hand-off directory, wiped at the start of every run
    pub staging_dir: PathBuf,
    /// Directory of the deployment tree receiving encrypted bundles
    pub publish_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            secrets_root: PathBuf::from("secrets"),
            staging_dir: PathBuf::from("secrets/current"),
            publish_dir: PathBuf::from("src/flake/enc"),
        }
    }
}

/// How random strings reach their requested length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// Keep drawing from the entropy source until the length is met
    Resample,
    /// Filter one batch of entropy and pad the remainder with a filler
    Pad,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    pub key_length: usize,
    pub password_length: usize,
    pub ssid_length: usize,
    pub fill: FillPolicy,
    /// Filler used by [`FillPolicy::Pad`]; must be an ASCII digit so it is
    /// valid for every alphabet
    pub filler: char,
    /// Rounds for SHA-512 crypt password hashes
    pub hash_rounds: usize,
    /// Comment stored in the admin SSH public key
    pub ssh_comment: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            key_length: 32,
            password_length: 32,
            ssid_length: 8,
            fill: FillPolicy::Resample,
            filler: '0',
            hash_rounds: 5000,
            ssh_comment: "altibiz@pidgeon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Superuser role that exists in every fresh cluster
    pub superuser: String,
    /// Operator role with full access
    pub admin_user: String,
    /// Role the Pidgeon service connects as
    pub app_user: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5433,
            name: "pidgeon".to_string(),
            superuser: "postgres".to_string(),
            admin_user: "altibiz".to_string(),
            app_user: "pidgeon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub ssl: bool,
    /// Prefix for the cloud id and the WiFi SSID
    pub id_prefix: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            ssl: true,
            id_prefix: "pidgeon-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthoritiesConfig {
    pub postgres_common_name: String,
    pub vpn_common_name: String,
    pub organization: String,
    pub ca_validity_days: u32,
    pub leaf_validity_days: u32,
}

impl Default for AuthoritiesConfig {
    fn default() -> Self {
        Self {
            postgres_common_name: "Pidgeon Postgres CA".to_string(),
            vpn_common_name: "Pidgeon VPN CA".to_string(),
            organization: "Altibiz".to_string(),
            ca_validity_days: 3650,
            leaf_validity_days: 365,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Indent width of embedded file contents in `secrets.yaml`
    pub indent: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self { indent: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Artifacts copied into the staging directory
    pub mirrored: Vec<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            mirrored: ["id", "admin.pass", "age.key", "wifi.ssid", "wifi.pass"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the provisioning engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        self.paths.validate()?;

        let secrets = &self.secrets;
        for (field, length) in [
            ("secrets.key_length", secrets.key_length),
            ("secrets.password_length", secrets.password_length),
            ("secrets.ssid_length", secrets.ssid_length),
        ] {
            if length == 0 {
                return Err(CoreError::Config(format!("{field} must be greater than zero")));
            }
        }

        if !secrets.filler.is_ascii_digit() {
            return Err(CoreError::Config(format!(
                "secrets.filler must be an ASCII digit, got {:?}",
                secrets.filler
            )));
        }

        if !(1..=9).contains(&self.bundle.indent) {
            return Err(CoreError::Config(format!(
                "bundle.indent must be between 1 and 9, got {}",
                self.bundle.indent
            )));
        }

        if self.authorities.ca_validity_days == 0 || self.authorities.leaf_validity_days == 0 {
            return Err(CoreError::Config(
                "certificate validity must be at least one day".to_string(),
            ));
        }

        let db = &self.database;
        let roles = [&db.superuser, &db.admin_user, &db.app_user];
        if roles.iter().any(|role| role.is_empty()) {
            return Err(CoreError::Config("database roles must not be empty".to_string()));
        }
        if db.superuser == db.admin_user
            || db.superuser == db.app_user
            || db.admin_user == db.app_user
        {
            return Err(CoreError::Config("database roles must be distinct".to_string()));
        }
        for (field, name) in [
            ("database.superuser", &db.superuser),
            ("database.admin_user", &db.admin_user),
            ("database.app_user", &db.app_user),
            ("database.name", &db.name),
        ] {
            if !is_valid_file_name(name) {
                return Err(CoreError::Config(format!(
                    "{field} must match [A-Za-z0-9._-] without a leading dot, got {name:?}"
                )));
            }
        }

        if let Some(name) = self
            .staging
            .mirrored
            .iter()
            .find(|name| !is_valid_file_name(name))
        {
            return Err(CoreError::Config(format!(
                "staging.mirrored contains an invalid artifact name {name:?}"
            )));
        }

        Ok(())
    }
}

impl PathsConfig {
    /// The staging directory is wiped on every run, so it must stay clear of
    /// durable state and of the deployment tree.
    ///
    /// Paths are compared as written; they are not canonicalised.
    pub fn validate(&self) -> Result<()> {
        let staging = self.staging_dir.as_path();
        let overlap = |what: &str| -> Result<()> {
            Err(CoreError::Config(format!(
                "paths.staging_dir {} overlaps {what}",
                staging.display()
            )))
        };

        if staging.as_os_str().is_empty() {
            return Err(CoreError::Config("paths.staging_dir must not be empty".to_string()));
        }
        if self.secrets_root.starts_with(staging) {
            return overlap("paths.secrets_root");
        }
        if self.publish_dir.starts_with(staging) || staging.starts_with(&self.publish_dir) {
            return overlap("paths.publish_dir");
        }
        for dir in [DEVICES_DIR, AUTHORITIES_DIR] {
            if staging.starts_with(self.secrets_root.join(dir)) {
                return overlap(&format!("{}/{dir}", self.secrets_root.display()));
            }
        }

        Ok(())
    }
}
