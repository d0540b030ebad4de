//! mksecrets
//!
//! Provisions a Pidgeon device: generates its secrets, signs its
//! certificates and publishes its encrypted bundle. The run report is
//! printed as JSON on stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use serde::Serialize;
use std::path::PathBuf;

use pidgeon_core::{logging, Config};
use pidgeon_provision::{publish, DeviceId, ProvisionRequest, Provisioner, Workspace};

#[derive(Parser)]
#[command(name = "mksecrets")]
#[command(author, version, about = "Pidgeon device secrets provisioning", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "PIDGEON_MKSECRETS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new device
    Provision {
        /// Domain of the cloud the device pushes measurements to
        #[arg(long, env = "PIDGEON_CLOUD_DOMAIN")]
        cloud_domain: String,
        /// First address of the network range scanned for meters
        #[arg(long, env = "PIDGEON_NETWORK_IP_RANGE_START")]
        ip_range_start: String,
        /// Last address of the network range scanned for meters
        #[arg(long, env = "PIDGEON_NETWORK_IP_RANGE_END")]
        ip_range_end: String,
        /// Tunnel address of the device, e.g. 10.255.255.2 or 10.255.255.2/16
        #[arg(long, env = "PIDGEON_VPN_IP")]
        vpn_ip: String,
    },
    /// Create missing certificate authorities
    EnsureAuthorities,
    /// Decrypt the published bundle of a device
    Decrypt {
        /// Device id (32 hex characters)
        #[arg(long)]
        device_id: String,
        /// age identity file; defaults to the device's age.key
        #[arg(long)]
        identity: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct AuthorityOutput {
    name: String,
    created: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            tracing::debug!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None => {
            let config = Config::default();
            config.validate().context("Invalid default config")?;
            Ok(config)
        }
    }
}

fn cmd_provision(config: Config, request: ProvisionRequest) -> Result<()> {
    let mut provisioner = Provisioner::from_config(config);
    let report = provisioner
        .run(&request, &mut OsRng)
        .context("Provisioning failed")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_ensure_authorities(config: Config) -> Result<()> {
    let mut provisioner = Provisioner::from_config(config);
    let authorities = provisioner
        .ensure_authorities()
        .context("Failed to ensure certificate authorities")?;

    let output: Vec<AuthorityOutput> = authorities
        .iter()
        .map(|authority| AuthorityOutput {
            name: authority.name().to_string(),
            created: authority.was_created(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn cmd_decrypt(config: Config, device_id: &str, identity: Option<PathBuf>) -> Result<()> {
    let provisioner = Provisioner::from_config(config);
    let layout = provisioner.layout();
    let device_id: DeviceId = device_id.parse()?;

    let identity_path = match identity {
        Some(path) => path,
        None => Workspace::open(layout, device_id)?.artifact_path("age.key")?,
    };
    let identity = std::fs::read_to_string(&identity_path)
        .with_context(|| format!("Failed to read identity {}", identity_path.display()))?;

    let published = layout.publish_path(&device_id);
    let ciphertext = std::fs::read_to_string(&published)
        .with_context(|| format!("Failed to read bundle {}", published.display()))?;

    let bundle = publish::decrypt(&ciphertext, &identity).context("Failed to decrypt bundle")?;
    tracing::info!(device_id = %device_id, "Bundle decrypted");
    print!("{}", bundle.as_str());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json {
        logging::init_json();
    } else {
        logging::init();
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Provision {
            cloud_domain,
            ip_range_start,
            ip_range_end,
            vpn_ip,
        } => cmd_provision(
            config,
            ProvisionRequest {
                cloud_domain,
                ip_range_start,
                ip_range_end,
                vpn_ip,
            },
        ),
        Commands::EnsureAuthorities => cmd_ensure_authorities(config),
        Commands::Decrypt {
            device_id,
            identity,
        } => cmd_decrypt(config, &device_id, identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_provision_arguments() {
        let cli = Cli::try_parse_from([
            "mksecrets",
            "provision",
            "--cloud-domain",
            "example.com",
            "--ip-range-start",
            "10.0.0.1",
            "--ip-range-end",
            "10.0.0.254",
            "--vpn-ip",
            "10.255.255.2",
        ])
        .unwrap();

        match cli.command {
            Commands::Provision { cloud_domain, vpn_ip, .. } => {
                assert_eq!(cloud_domain, "example.com");
                assert_eq!(vpn_ip, "10.255.255.2");
            }
            _ => panic!("expected provision"),
        }
    }

    #[test]
    fn test_missing_config_file_fails() {
        let path = PathBuf::from("/nonexistent/mksecrets.toml");
        assert!(load_config(Some(&path)).is_err());
    }
}
