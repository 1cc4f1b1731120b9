use std::path::PathBuf;

use clap::Parser;
use fork_genesis::{from_toml_path, ForkConfig};
use fork_interface::StorageValue;
use fork_substrate_adapter::RpcConfig;
use serde::{Deserialize, Serialize};

/// The full configuration file: the node connection plus the fork run.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Node connection.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Everything else.
    #[serde(flatten)]
    pub fork: ForkConfig,
}

/// Snapshots a live chain and writes a genesis for a fork of it.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// TOML configuration. Every setting it leaves out takes its default.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// HTTP address of the node, overriding the configured one.
    #[arg(long)]
    pub rpc_url: Option<String>,
    /// Delete a cached snapshot and fetch the current state.
    #[arg(long)]
    pub refresh: bool,
    /// Fetch leaf chunks concurrently.
    #[arg(long)]
    pub parallel: bool,
    /// Hex address written to the sudo key of the fork.
    #[arg(long)]
    pub sudo: Option<String>,
    /// Keep the code blob of the source chain instead of the local runtime.
    #[arg(long)]
    pub no_code_update: bool,
}

impl Args {
    /// Reads the configuration file, if any, and applies the command line overrides.
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let mut config: AppConfig = match &self.config {
            Some(path) => from_toml_path(path)?,
            None => AppConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.rpc_url {
            config.rpc.url = url.clone();
        }
        if self.parallel {
            config.fork.fetch.parallel_leaves = true;
        }
        if let Some(sudo) = &self.sudo {
            config.fork.genesis.sudo_key = Some(StorageValue::new(sudo.as_str()));
        }
        if self.no_code_update {
            config.fork.genesis.update_code = false;
        }
    }
}
