// Relay configuration
//
// Every setting comes from a flag or its environment variable. The parsed
// command line is turned into a RelayConfig once, validated, and never
// changed afterwards.

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use orgrelay_core::transport::addresses::overlay_port;
use orgrelay_core::{
    AddressSelection, AdmissionConfig, NodeAddresses, TimeoutPolicy, DEFAULT_HTTP_PORT,
    DEFAULT_IDENTITY_PATH,
};
use std::path::PathBuf;
use std::time::Duration;

/// Port announced when a TLS terminator sits in front of the relay.
const PROXY_PORT: u16 = 443;

#[derive(Parser, Debug)]
#[command(name = "orgrelay")]
#[command(about = "Relay node for the org peer-to-peer overlay", long_about = None)]
#[command(version)]
pub struct Cli {
    /// HTTP port; the overlay listens one above it
    #[arg(long, env = "PORT", default_value_t = DEFAULT_HTTP_PORT)]
    pub port: u16,

    /// Overlay port assigned from outside (takes precedence over port + 1)
    #[arg(long, env = "EXTERNAL_PORT")]
    pub external_port: Option<u16>,

    /// Running behind a TLS proxy: the overlay uses port 443
    #[arg(long, env = "BEHIND_PROXY", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub behind_proxy: bool,

    /// Host advertised to peers
    #[arg(long, env = "ANNOUNCE_HOST", default_value = "0.0.0.0")]
    pub announce_host: String,

    #[arg(long, env = "IDENTITY_PATH", default_value = DEFAULT_IDENTITY_PATH)]
    pub identity_path: PathBuf,

    /// Bootstrap multiaddrs; replaces the compiled-in list
    #[arg(long = "bootstrap", env = "BOOTSTRAP_NODES", value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Allowed CORS origins, `*` for any
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    #[arg(long, env = "QUEUE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    #[arg(long, env = "QUEUE_MAX_SIZE", default_value_t = 200)]
    pub queue_size: usize,

    #[arg(long, env = "QUEUE_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Abort handlers that exceed the timeout instead of letting them finish
    #[arg(long, env = "QUEUE_CANCEL_ON_TIMEOUT", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub cancel_on_timeout: bool,

    /// Which reported address to announce: first, last or port:<n>
    #[arg(long, env = "ADDRESS_SELECTION", default_value = "first")]
    pub address_selection: AddressSelection,

    #[arg(long, env = "PUBLIC_DIR", default_value = "public")]
    pub public_dir: PathBuf,

    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub http_port: u16,
    /// Overlay port from outside, already folded with the proxy flag
    pub external_port: Option<u16>,
    pub announce_host: String,
    pub identity_path: PathBuf,
    pub bootstrap_nodes: Vec<String>,
    pub cors_origins: Vec<String>,
    pub admission: AdmissionConfig,
    pub address_selection: AddressSelection,
    pub public_dir: PathBuf,
    pub log_json: bool,
}

impl Cli {
    /// Resolve the command line into a validated config.
    /// An empty bootstrap list falls back to `default_bootstrap`.
    pub fn into_config(self, default_bootstrap: Vec<String>) -> Result<RelayConfig> {
        let bootstrap_nodes = if self.bootstrap.is_empty() {
            default_bootstrap
        } else {
            self.bootstrap
        };

        let external_port = self
            .external_port
            .or(self.behind_proxy.then_some(PROXY_PORT));

        let config = RelayConfig {
            http_port: self.port,
            external_port,
            announce_host: self.announce_host,
            identity_path: self.identity_path,
            bootstrap_nodes,
            cors_origins: self.cors_origins,
            admission: AdmissionConfig {
                concurrent_workers: self.workers,
                max_queue_size: self.queue_size,
                timeout: Duration::from_secs(self.timeout_secs),
                timeout_policy: if self.cancel_on_timeout {
                    TimeoutPolicy::Cancel
                } else {
                    TimeoutPolicy::Detach
                },
            },
            address_selection: self.address_selection,
            public_dir: self.public_dir,
            log_json: self.log_json,
        };
        config.validate()?;
        Ok(config)
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        let admission = &self.admission;
        if admission.concurrent_workers == 0 {
            bail!("QUEUE_WORKERS must be at least 1");
        }
        if admission.max_queue_size < admission.concurrent_workers {
            bail!(
                "QUEUE_MAX_SIZE ({}) must not be smaller than QUEUE_WORKERS ({})",
                admission.max_queue_size,
                admission.concurrent_workers
            );
        }
        if admission.timeout.is_zero() {
            bail!("QUEUE_TIMEOUT_SECS must be greater than 0");
        }
        if let Some(origin) = self
            .cors_origins
            .iter()
            .find(|o| o.as_str() != "*" && !o.contains("://"))
        {
            bail!("CORS origin {:?} needs a scheme, e.g. https://{}", origin, origin);
        }
        if overlay_port(self.http_port, self.external_port).is_none() {
            bail!(
                "PORT {} leaves no room for the overlay port; set EXTERNAL_PORT",
                self.http_port
            );
        }
        Ok(())
    }

    pub fn node_addresses(&self) -> Result<NodeAddresses> {
        NodeAddresses::from_ports(self.http_port, self.external_port, &self.announce_host)
            .context("Invalid overlay address configuration")
    }
}
