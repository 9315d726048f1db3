// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Environment-first configuration, following the Ansible role this pipeline
//! replaces: every setting has an environment variable and a sane default,
//! with `clap` flags available as local overrides.

use std::{fmt, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Parser, ValueEnum};

/// Which of the four worker roles this process should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum Role {
    Compute,
    Build,
    Upload,
    Validate,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Compute => "compute",
            Role::Build => "build",
            Role::Upload => "upload",
            Role::Validate => "validate",
        };
        f.write_str(s)
    }
}

/// Resolution for Open Question (a): whether the batch compute call targets
/// `epoch - 1` (matching the original's batch call) or `epoch` (matching its
/// per-epoch fallback loop). Configurable rather than guessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ComputeEpochOffset {
    /// `--epoch {epoch}`
    Zero,
    /// `--epoch {epoch - 1}` (the default, matching the original batch call)
    One,
}

impl ComputeEpochOffset {
    pub fn apply(self, epoch: i64) -> i64 {
        match self {
            ComputeEpochOffset::Zero => epoch,
            ComputeEpochOffset::One => epoch - 1,
        }
    }
}

/// Resolution for Open Question (c): which `forest-tool snapshot` subcommand
/// performs primary validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PrimaryValidateSubcommand {
    Validate,
    ValidateDiffs,
}

impl fmt::Display for PrimaryValidateSubcommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimaryValidateSubcommand::Validate => "validate",
            PrimaryValidateSubcommand::ValidateDiffs => "validate-diffs",
        };
        f.write_str(s)
    }
}

/// A secret that should never be printed verbatim in logs or `Debug` output.
#[derive(Clone, Default)]
pub struct Secret(pub String);

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_owned()))
    }
}

/// Process-wide configuration, assembled once at startup and shared behind
/// an `Arc` with whichever worker `--role` selects.
#[derive(Debug, Clone, Parser)]
#[command(name = "forest-snapshotd", author, version, about)]
pub struct PipelineConfig {
    /// Which worker role to run.
    #[arg(long, value_enum, env = "FOREST_SNAPSHOT_ROLE")]
    pub role: Role,

    // ---- Chain / network ----
    #[arg(long, env = "CHAIN", default_value = "testnet")]
    pub chain: String,
    #[arg(long, env = "SNAPSHOT_FORMAT", default_value = "v1")]
    pub snapshot_format: String,
    #[arg(long, env = "SNAPSHOT_PATH", default_value = "/data/snapshots")]
    pub snapshot_path: PathBuf,
    #[arg(
        long,
        env = "SNAPSHOT_ARCHIVE_PATH",
        default_value = "/data/snapshots-archive"
    )]
    pub snapshot_archive_path: PathBuf,

    // ---- Build worker ----
    #[arg(long, env = "BUILD_DELAY", default_value = "1200")]
    pub build_delay_secs: u64,
    #[arg(long, env = "BUILD_LATEST_SNAPSHOTS", default_value = "false")]
    pub build_latest_snapshots: bool,
    #[arg(long, env = "WAIT_FOR_COMPUTATION", default_value = "true")]
    pub wait_for_computation: bool,
    #[arg(long, env = "DEFAULT_START_EPOCH", default_value = "0")]
    pub default_start_epoch: i64,
    #[arg(long, env = "EMIT_LATEST_V1", default_value = "false")]
    pub emit_latest_v1: bool,

    // ---- Compute worker ----
    #[arg(long, env = "COMPUTE_BATCH_SIZE", default_value = "100")]
    pub compute_batch_size: i64,
    #[arg(long, value_enum, default_value = "one")]
    pub compute_epoch_offset: ComputeEpochOffset,

    // ---- Metrics ----
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
    #[arg(long, default_value = "0.0.0.0")]
    pub metrics_bind: IpAddr,

    // ---- Broker ----
    #[arg(long, env = "RABBITMQ_HOST", default_value = "rabbitmq")]
    pub rabbitmq_host: String,
    #[arg(long, env = "RABBITMQ_USER", default_value = "user")]
    pub rabbitmq_user: String,
    #[arg(long, env = "RABBITMQ_PASS", default_value = "password")]
    pub rabbitmq_pass: Secret,

    // ---- Object store ----
    #[arg(long, env = "R2_ENDPOINT_URL")]
    pub r2_endpoint_url: Option<url::Url>,
    #[arg(long, env = "R2_ACCESS_KEY_ID", default_value = "")]
    pub r2_access_key_id: String,
    #[arg(long, env = "R2_SECRET_ACCESS_KEY", default_value = "")]
    pub r2_secret_access_key: Secret,
    #[arg(long, env = "R2_ARCHIVE_BUCKET_NAME", default_value = "my-bucket")]
    pub r2_archive_bucket_name: String,
    #[arg(long, env = "R2_LATEST_BUCKET_NAME", default_value = "my-bucket")]
    pub r2_latest_bucket_name: String,

    // ---- Chain node / RPC ----
    #[arg(long, env = "FOREST_HOST", default_value = "127.0.0.1")]
    pub forest_host: String,
    #[arg(long, env = "FOREST_RPC_PORT", default_value = "2345")]
    pub forest_rpc_port: u16,
    #[arg(long, env = "FOREST_TOKEN_PATH")]
    pub forest_token_path: Option<PathBuf>,
    #[arg(long, env = "LOTUS_HOST", default_value = "127.0.0.1")]
    pub lotus_host: String,
    #[arg(long, env = "LOTUS_RPC_PORT", default_value = "1234")]
    pub lotus_rpc_port: u16,
    #[arg(
        long,
        env = "FULL_RPC_NODE",
        default_value = "http://127.0.0.1:1234/rpc/v0"
    )]
    pub full_rpc_node: url::Url,
    #[arg(
        long,
        env = "BACKUP_RPC_NODE",
        default_value = "http://127.0.0.1:1234/rpc/v0"
    )]
    pub backup_rpc_node: url::Url,

    // ---- Validate worker ----
    #[arg(long, value_enum, default_value = "validate")]
    pub primary_validate_subcommand: PrimaryValidateSubcommand,

    // ---- Notifications ----
    #[arg(long, env = "SLACK_TOKEN")]
    pub slack_token: Option<Secret>,
    #[arg(long, env = "SLACK_CHANNEL", default_value = "#forest-dump")]
    pub slack_channel: String,
}

impl PipelineConfig {
    pub const SECONDS_PER_EPOCH: i64 = 30;
    pub const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(2400);
    pub const VALIDATE_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Default `METRICS_PORT` per role, matching the original Ansible role
    /// (build publishes on 6116, every other worker defaults to 8000).
    pub fn metrics_port(&self) -> u16 {
        self.metrics_port.unwrap_or(match self.role {
            Role::Build => 6116,
            _ => 8000,
        })
    }

    /// `FULLNODE_API_INFO`, handed to every chain-tool subprocess:
    /// `"<token>:/ip4/<resolved_ip>/tcp/<port>/http"`.
    pub fn fullnode_api_info(&self) -> anyhow::Result<String> {
        let token = match &self.forest_token_path {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?
                .trim()
                .to_owned(),
            None => String::new(),
        };
        let ip: IpAddr = resolve_host(&self.forest_host)?;
        Ok(format!(
            "{token}:/ip4/{ip}/tcp/{}/http",
            self.forest_rpc_port
        ))
    }
}

fn resolve_host(host: &str) -> anyhow::Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    use std::net::ToSocketAddrs;
    (host, 0)
        .to_socket_addrs()?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| anyhow::anyhow!("could not resolve host {host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_epoch_offset_matches_original_asymmetry() {
        assert_eq!(ComputeEpochOffset::One.apply(500), 499);
        assert_eq!(ComputeEpochOffset::Zero.apply(500), 500);
    }

    #[test]
    fn metrics_port_defaults_differ_by_role() {
        let mut cfg = PipelineConfig::try_parse_from([
            "forest-snapshotd",
            "--role",
            "build",
            "--rabbitmq-pass",
            "x",
        ])
        .unwrap();
        assert_eq!(cfg.metrics_port(), 6116);
        cfg.role = Role::Upload;
        assert_eq!(cfg.metrics_port(), 8000);
    }
}
