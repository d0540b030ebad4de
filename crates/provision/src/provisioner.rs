//! End-to-end provisioning run.
//!
//! ```text
//! validate config and request
//!     ↓
//! allocate workspace → reset staging → id
//!     ↓
//! admin password, admin SSH key, API key, age key
//!     ↓
//! postgres CA → postgres leaf → role passwords → SQL bootstrap
//!     ↓
//! WiFi SSID and passphrase
//!     ↓
//! vpn CA → vpn credential
//!     ↓
//! pidgeon.env, wifi.env, secrets.yaml
//!     ↓
//! encrypt to the device age key → publish
//! ```
//!
//! Any error aborts the run immediately. Nothing is rolled back: the
//! workspace keeps whatever was generated so an operator can inspect it.

use rand::{CryptoRng, RngCore};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use pidgeon_core::{AuthoritiesConfig, Config};

use crate::authority::{
    AuthorityCoordinator, AuthorityRef, CertificateAuthorityStore, FsAuthorityStore,
};
use crate::bundle::{self, env, DatabaseRole, RoleKind};
use crate::crypto::{CertificateSubject, CryptoProvider, KeyAlgorithm, NativeCryptoProvider};
use crate::error::{ProvisionError, ProvisionResult};
use crate::publish::{self, Published};
use crate::random::RandomStrings;
use crate::secrets::{Artifact, ArtifactKind, SecretGenerator};
use crate::staging::{MirrorWarning, StagingExporter};
use crate::workspace::{DeviceId, Layout, Workspace};

/// Authority issuing database client certificates.
pub const POSTGRES_AUTHORITY: &str = "postgres";

/// Authority issuing VPN credentials.
pub const VPN_AUTHORITY: &str = "vpn";

/// Name of the rendered bundle inside the workspace.
pub const BUNDLE_ARTIFACT: &str = "secrets.yaml";

/// Operator supplied inputs of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Domain of the cloud the device pushes measurements to
    pub cloud_domain: String,
    /// First address of the network range scanned for meters
    pub ip_range_start: String,
    /// Last address of the network range scanned for meters
    pub ip_range_end: String,
    /// Tunnel address, optionally with a `/prefix`
    pub vpn_ip: String,
}

impl ProvisionRequest {
    /// Check every input without touching the filesystem.
    pub fn validate(&self) -> ProvisionResult<()> {
        for (field, value) in [
            ("cloud_domain", &self.cloud_domain),
            ("ip_range_start", &self.ip_range_start),
            ("ip_range_end", &self.ip_range_end),
            ("vpn_ip", &self.vpn_ip),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisionError::MissingInput { field });
            }
        }
        self.vpn_address().map(|_| ())
    }

    /// Tunnel address with any `/prefix` stripped.
    pub fn vpn_address(&self) -> ProvisionResult<IpAddr> {
        let raw = self.vpn_ip.trim();
        let address = raw.split_once('/').map_or(raw, |(address, _)| address);
        address.parse().map_err(|e| {
            ProvisionError::generation("vpn", format!("invalid tunnel address {raw:?}: {e}"))
        })
    }
}

/// An authority touched by a run.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorityUsage {
    /// Authority name
    pub name: String,
    /// Whether this run created the authority
    pub created: bool,
}

impl From<&AuthorityRef> for AuthorityUsage {
    fn from(authority: &AuthorityRef) -> Self {
        Self {
            name: authority.name().to_string(),
            created: authority.was_created(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    /// Identity of the provisioned device
    pub device_id: DeviceId,
    /// Workspace directory holding every plaintext artifact
    pub workspace: PathBuf,
    /// Encrypted bundle in the deployment tree
    pub published: Published,
    /// Rendered env documents, SQL bootstrap and bundle
    pub documents: Vec<PathBuf>,
    /// Authorities used, in signing order
    pub authorities: Vec<AuthorityUsage>,
    /// Generated artifacts, in generation order
    pub artifacts: Vec<Artifact>,
    /// Staging failures; never fatal
    pub warnings: Vec<MirrorWarning>,
}

/// Drives one provisioning run after another against a shared secrets root.
pub struct Provisioner<P, S> {
    config: Config,
    layout: Layout,
    provider: P,
    authorities: AuthorityCoordinator<S>,
    staging: StagingExporter,
}

impl Provisioner<NativeCryptoProvider, FsAuthorityStore> {
    /// Provisioner using the in-process crypto provider and the configured
    /// filesystem layout.
    pub fn from_config(config: Config) -> Self {
        let layout = Layout::from_config(&config.paths);
        let provider = NativeCryptoProvider::new(config.secrets.hash_rounds);
        let store = FsAuthorityStore::from_layout(&layout);
        Self::new(config, layout, provider, store)
    }
}

impl<P: CryptoProvider, S: CertificateAuthorityStore> Provisioner<P, S> {
    pub fn new(config: Config, layout: Layout, provider: P, store: S) -> Self {
        let staging = StagingExporter::new(
            layout.staging_dir(),
            config.staging.mirrored.iter().cloned(),
        );
        Self {
            config,
            layout,
            provider,
            authorities: AuthorityCoordinator::new(store),
            staging,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Create any missing certificate authority.
    pub fn ensure_authorities(&mut self) -> ProvisionResult<Vec<AuthorityRef>> {
        let postgres = self.ensure(POSTGRES_AUTHORITY)?;
        let vpn = self.ensure(VPN_AUTHORITY)?;
        Ok(vec![postgres, vpn])
    }

    fn ensure(&mut self, name: &str) -> ProvisionResult<AuthorityRef> {
        let subject = authority_subject(&self.config.authorities, name);
        self.authorities.ensure_ca(&self.provider, name, &subject)
    }

    /// Provision one device.
    pub fn run<R: RngCore + CryptoRng>(
        &mut self,
        request: &ProvisionRequest,
        rng: &mut R,
    ) -> ProvisionResult<ProvisionReport> {
        let result = self.execute(request, rng);
        if let Err(e) = &result {
            tracing::error!(error = %e, "Provisioning failed");
        }
        result
    }

    fn execute<R: RngCore + CryptoRng>(
        &mut self,
        request: &ProvisionRequest,
        rng: &mut R,
    ) -> ProvisionResult<ProvisionReport> {
        self.config.validate()?;
        request.validate()?;
        let vpn_ip = request.vpn_address()?;

        let workspace = Workspace::allocate(&self.layout, rng)?;
        let device_id = *workspace.device_id();
        let mut run = Run::new(&workspace, &self.staging);

        if let Err(e) = self.layout.reset_staging() {
            run.warn(MirrorWarning {
                name: self.layout.staging_dir().display().to_string(),
                reason: e.to_string(),
            });
        }

        let path = workspace.write_artifact("id", device_id.to_string().as_bytes())?;
        run.record(Artifact {
            name: "id".to_string(),
            kind: ArtifactKind::Identifier {
                length: device_id.to_string().len(),
                prefix: String::new(),
            },
            files: vec![path],
        });

        let secrets = &self.config.secrets;
        let generator = SecretGenerator::new(&self.provider, RandomStrings::from_config(secrets));
        let common_name = format!("{}{device_id}", self.config.cloud.id_prefix);

        run.record(generator.password(rng, &workspace, "admin.pass", secrets.password_length)?);
        run.record(generator.keypair(
            &workspace,
            "admin.ssh",
            KeyAlgorithm::SshEd25519,
            &secrets.ssh_comment,
        )?);
        run.record(generator.random_key(rng, &workspace, "api.key", secrets.key_length)?);
        run.record(generator.keypair(&workspace, "age.key", KeyAlgorithm::Age, "")?);

        // database
        let authorities = &self.config.authorities;
        let postgres = self.authorities.ensure_ca(
            &self.provider,
            POSTGRES_AUTHORITY,
            &authority_subject(authorities, POSTGRES_AUTHORITY),
        )?;
        run.authority(&postgres);

        let leaf = CertificateSubject::new(common_name.as_str(), authorities.leaf_validity_days)
            .with_organization(authorities.organization.as_str());
        run.record(generator.certificate(
            &self.authorities,
            &postgres,
            &workspace,
            "postgres",
            &leaf,
        )?);

        let database = &self.config.database;
        let roles = [
            (database.superuser.as_str(), RoleKind::Builtin),
            (database.admin_user.as_str(), RoleKind::Admin),
            (database.app_user.as_str(), RoleKind::Application),
        ];
        let mut passwords = Vec::with_capacity(roles.len());
        for (role, _) in &roles {
            let name = role_password_name(role);
            run.record(generator.password(rng, &workspace, &name, secrets.password_length)?);
            passwords.push(read_secret(&workspace, &name)?);
        }
        let sql = bundle::render_sql_bootstrap(
            &database.name,
            &roles
                .iter()
                .zip(&passwords)
                .map(|((name, kind), password)| DatabaseRole {
                    name: *name,
                    password: password.as_str(),
                    kind: *kind,
                })
                .collect::<Vec<_>>(),
        )?;
        run.documents.push(workspace.write_artifact("postgres.sql", sql.as_bytes())?);
        tracing::info!(artifact = "postgres.sql", "SQL bootstrap rendered");

        // wireless
        run.record(generator.identifier(
            rng,
            &workspace,
            "wifi.ssid",
            &self.config.cloud.id_prefix,
            secrets.ssid_length,
        )?);
        run.record(generator.random_key(rng, &workspace, "wifi.pass", secrets.key_length)?);

        // tunnel
        let vpn = self.authorities.ensure_ca(
            &self.provider,
            VPN_AUTHORITY,
            &authority_subject(authorities, VPN_AUTHORITY),
        )?;
        run.authority(&vpn);

        let leaf = leaf.with_ip_address(vpn_ip);
        run.record(generator.vpn_credential(&self.authorities, &vpn, &workspace, "vpn", &leaf)?);

        // bundle
        let api_key = read_secret(&workspace, "api.key")?;
        let wifi_ssid = read_secret(&workspace, "wifi.ssid")?;
        let wifi_pass = read_secret(&workspace, "wifi.pass")?;
        let app_password = passwords
            .last()
            .ok_or_else(|| ProvisionError::generation("pidgeon.env", "no application password"))?;
        let port = database.port.to_string();
        let database_url = Zeroizing::new(format!(
            "postgres://{}:{}@{}:{}/{}",
            database.app_user,
            app_password.as_str(),
            database.host,
            port,
            database.name
        ));

        let pidgeon_env = bundle::render_env_document(&[
            (env::DATABASE_URL, database_url.as_str()),
            (env::CLOUD_SSL, if self.config.cloud.ssl { "true" } else { "false" }),
            (env::CLOUD_DOMAIN, request.cloud_domain.trim()),
            (env::CLOUD_API_KEY, api_key.as_str()),
            (env::CLOUD_ID, common_name.as_str()),
            (env::DB_DOMAIN, database.host.as_str()),
            (env::DB_PORT, port.as_str()),
            (env::DB_USER, database.app_user.as_str()),
            (env::DB_PASSWORD, app_password.as_str()),
            (env::DB_NAME, database.name.as_str()),
            (env::NETWORK_IP_RANGE_START, request.ip_range_start.trim()),
            (env::NETWORK_IP_RANGE_END, request.ip_range_end.trim()),
            (env::WIFI_SSID, wifi_ssid.as_str()),
            (env::WIFI_PASS, wifi_pass.as_str()),
        ])
        .map(Zeroizing::new)?;
        run.documents.push(workspace.write_artifact("pidgeon.env", pidgeon_env.as_bytes())?);

        let wifi_env = bundle::render_env_document(&[
            (env::WIRELESS_SSID, wifi_ssid.as_str()),
            (env::WIRELESS_PASS, wifi_pass.as_str()),
        ])
        .map(Zeroizing::new)?;
        run.documents.push(workspace.write_artifact("wifi.env", wifi_env.as_bytes())?);

        let mut contents: Vec<(&str, Zeroizing<String>)> = Vec::new();
        for name in [
            "admin.pass.hash",
            "admin.ssh.pub",
            "api.key",
            "pidgeon.env",
            "wifi.env",
            "postgres.sql",
            "postgres.crt",
            "postgres.key",
        ] {
            contents.push((name, read_secret(&workspace, name)?));
        }
        contents.push((
            "postgres-ca.crt",
            Zeroizing::new(self.authorities.certificate_pem(&postgres)?.to_string()),
        ));
        for name in ["vpn.crt", "vpn.key"] {
            contents.push((name, read_secret(&workspace, name)?));
        }
        contents.push((
            "vpn-ca.crt",
            Zeroizing::new(self.authorities.certificate_pem(&vpn)?.to_string()),
        ));

        let entries: Vec<(&str, &str)> = contents
            .iter()
            .map(|(name, content)| (*name, content.as_str()))
            .collect();
        let document = bundle::render_hierarchical_document(&entries, self.config.bundle.indent)
            .map(Zeroizing::new)?;
        run.documents.push(workspace.write_artifact(BUNDLE_ARTIFACT, document.as_bytes())?);
        tracing::info!(entries = entries.len(), "Bundle assembled");

        // publish
        let recipient = workspace.read_artifact("age.key.pub")?;
        let ciphertext = publish::encrypt(&document, &recipient)?;
        let published = publish::publish(&ciphertext, &self.layout.publish_path(&device_id))?;

        tracing::info!(
            device_id = %device_id,
            warnings = run.warnings.len(),
            "Device provisioned"
        );

        Ok(ProvisionReport {
            device_id,
            workspace: workspace.path().to_path_buf(),
            published,
            documents: run.documents,
            authorities: run.authorities,
            artifacts: run.artifacts,
            warnings: run.warnings,
        })
    }
}

/// Subject of the root certificate of authority `name`.
pub fn authority_subject(config: &AuthoritiesConfig, name: &str) -> CertificateSubject {
    let common_name = match name {
        VPN_AUTHORITY => config.vpn_common_name.as_str(),
        POSTGRES_AUTHORITY => config.postgres_common_name.as_str(),
        other => other,
    };
    CertificateSubject::new(common_name, config.ca_validity_days)
        .with_organization(config.organization.as_str())
}

/// Workspace artifact holding the password of a database role.
pub fn role_password_name(role: &str) -> String {
    format!("postgres-{role}.pass")
}

fn read_secret(workspace: &Workspace, name: &str) -> ProvisionResult<Zeroizing<String>> {
    workspace.read_artifact(name).map(Zeroizing::new)
}

/// Bookkeeping of one run.
struct Run<'a> {
    workspace: &'a Workspace,
    staging: &'a StagingExporter,
    artifacts: Vec<Artifact>,
    documents: Vec<PathBuf>,
    authorities: Vec<AuthorityUsage>,
    warnings: Vec<MirrorWarning>,
}

impl<'a> Run<'a> {
    fn new(workspace: &'a Workspace, staging: &'a StagingExporter) -> Self {
        Self {
            workspace,
            staging,
            artifacts: Vec::new(),
            documents: Vec::new(),
            authorities: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Keep `artifact` for the report and mirror whichever of its facets
    /// are selected for staging.
    fn record(&mut self, artifact: Artifact) {
        for file in &artifact.files {
            self.stage(file);
        }
        self.artifacts.push(artifact);
    }

    fn authority(&mut self, authority: &AuthorityRef) {
        self.authorities.push(AuthorityUsage::from(authority));
    }

    fn stage(&mut self, file: &Path) {
        let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
            return;
        };
        if !self.staging.is_mirrored(name) {
            return;
        }

        let warning = match self.workspace.read_artifact(name) {
            Ok(content) => {
                let content = Zeroizing::new(content);
                self.staging.mirror(name, content.as_bytes()).err()
            }
            Err(e) => Some(MirrorWarning {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        };
        if let Some(warning) = warning {
            self.warn(warning);
        }
    }

    fn warn(&mut self, warning: MirrorWarning) {
        tracing::warn!(artifact = %warning.name, reason = %warning.reason, "Staging mirror failed");
        self.warnings.push(warning);
    }
}
