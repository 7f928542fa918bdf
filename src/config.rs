use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Docker connection mode used when a host has no explicit
/// `docker_host`/`docker_ssh_cmd` override in its inventory vars.
/// Other recognized inventory vars: `docker_tcp_port`, `scan_disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum ConnectionMode {
    Local,
    Tcp,
    Ssh,
}

/// Host-key verification policy for SSH-mode Docker connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum StrictHostKeyPolicy {
    Strict,
    AcceptNew,
    Insecure,
}

/// DDUI — declarative orchestration control plane for fleets of Docker hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "ddui")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Postgres connection string
    #[arg(long, env = "DDUI_DATABASE_URL")]
    pub database_url: String,

    /// Max Postgres pool connections
    #[arg(long, env = "DDUI_DATABASE_MAX_CONNECTIONS", default_value = "10")]
    pub database_max_connections: u32,

    /// Port the health/drift/deploy HTTP surface listens on
    #[arg(short, long, env = "DDUI_PORT", default_value = "8765")]
    pub port: u16,

    /// Hostname to bind to
    #[arg(long, env = "DDUI_HOSTNAME")]
    pub hostname: Option<String>,

    /// Path to the Ansible-style inventory file
    #[arg(long, env = "DDUI_INVENTORY_PATH", default_value = "./inventory.yml")]
    pub inventory_path: PathBuf,

    /// Root directory containing the IaC repository tree
    #[arg(long, env = "DDUI_IAC_ROOT", default_value = "/opt/stacks")]
    pub iac_root: PathBuf,

    /// Subdirectory name beneath the root that hosts `<scope>/<stack>` trees
    #[arg(long, env = "DDUI_IAC_DIRNAME", default_value = "docker-compose")]
    pub iac_dirname: String,

    /// Base scan interval per host, in milliseconds
    #[arg(long, env = "DDUI_SCAN_BASE_INTERVAL_MS", default_value = "5000")]
    pub scan_base_interval_ms: u64,

    /// Boosted scan interval while a host has active viewers, in milliseconds
    #[arg(long, env = "DDUI_SCAN_BOOST_INTERVAL_MS", default_value = "500")]
    pub scan_boost_interval_ms: u64,

    /// Per-host scan timeout, in seconds
    #[arg(long, env = "DDUI_SCAN_HOST_TIMEOUT_SECS", default_value = "45")]
    pub scan_host_timeout_secs: u64,

    /// Maximum number of hosts scanned concurrently in a full-fleet sweep
    #[arg(long, env = "DDUI_SCAN_CONCURRENCY", default_value = "8")]
    pub scan_concurrency: usize,

    /// How often the IaC Walker re-scans the filesystem tree, in seconds
    #[arg(long, env = "DDUI_IAC_WALK_INTERVAL_SECS", default_value = "30")]
    pub iac_walk_interval_secs: u64,

    /// How often the Policy Engine re-evaluates auto-apply for all stacks, in seconds
    #[arg(long, env = "DDUI_AUTO_DEVOPS_INTERVAL_SECS", default_value = "60")]
    pub auto_devops_interval_secs: u64,

    /// Docker connection mode for hosts without an explicit override
    #[arg(long, env = "DDUI_CONNECTION_MODE", default_value = "ssh")]
    pub connection_mode: ConnectionMode,

    /// Host name treated as "local" — connected to via the local Docker socket
    #[arg(long, env = "DDUI_LOCAL_HOST_NAME", default_value = "localhost")]
    pub local_host_name: String,

    /// Local Docker socket path used for local-mode connections
    #[arg(long, env = "DDUI_LOCAL_SOCKET", default_value = "/var/run/docker.sock")]
    pub local_socket: PathBuf,

    /// Default SSH user for ssh-mode connections
    #[arg(long, env = "DDUI_SSH_USER", default_value = "root")]
    pub ssh_user: String,

    /// Default SSH port for ssh-mode connections
    #[arg(long, env = "DDUI_SSH_PORT", default_value = "22")]
    pub ssh_port: u16,

    /// Path to the SSH private key used for ssh-mode connections
    #[arg(long, env = "DDUI_SSH_KEY_PATH")]
    pub ssh_key_path: Option<PathBuf>,

    /// Host-key verification policy for ssh-mode connections
    #[arg(long, env = "DDUI_SSH_STRICT_HOST_KEY", default_value = "accept-new")]
    pub ssh_strict_host_key: StrictHostKeyPolicy,

    /// SOPS age key, literal value or `@/path/to/key` indirection
    #[arg(long, env = "DDUI_SOPS_AGE_KEY")]
    pub sops_age_key: Option<String>,

    /// Path to a file containing the SOPS age key (alternative to inline value)
    #[arg(long, env = "DDUI_SOPS_AGE_KEY_FILE")]
    pub sops_age_key_file: Option<PathBuf>,

    /// Owner assigned to hosts/stacks with no `owner` inventory var
    #[arg(long, env = "DDUI_DEFAULT_OWNER", default_value = "unassigned")]
    pub default_owner: String,

    /// Fallback value for the auto-apply policy when no override exists anywhere
    #[arg(long, env = "DDUI_AUTO_APPLY_DEFAULT", default_value = "false")]
    pub auto_apply_default: bool,

    /// Number of terminal (success/failed) deployment stamps retained per stack
    #[arg(long, env = "DDUI_STAMP_RETENTION", default_value = "20")]
    pub stamp_retention: i64,

    /// Log level / `RUST_LOG`-style filter
    #[arg(long, env = "DDUI_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn parse() -> Result<Self> {
        let config = <Self as Parser>::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scan_boost_interval_ms > self.scan_base_interval_ms {
            anyhow::bail!("scan boost interval must not exceed the base interval");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        match &self.hostname {
            Some(hostname) => format!("{hostname}:{}", self.port),
            None => format!("0.0.0.0:{}", self.port),
        }
    }

    /// Resolve the configured SOPS age key, following `@/path` indirection
    /// and `_FILE` companion semantics (spec §6).
    pub fn resolve_sops_age_key(&self) -> Result<Option<String>> {
        if let Some(key) = &self.sops_age_key {
            if let Some(path) = key.strip_prefix('@') {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read SOPS key indirection file {path}"))?;
                return Ok(Some(contents.trim().to_string()));
            }
            return Ok(Some(key.clone()));
        }
        if let Some(path) = &self.sops_age_key_file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read SOPS key file {}", path.display()))?;
            return Ok(Some(contents.trim().to_string()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_defaults_to_all_interfaces() {
        let config = Config::try_parse_from([
            "ddui",
            "--database-url",
            "postgres://localhost/ddui",
        ])
        .unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:8765");
    }

    #[test]
    fn test_bind_address_uses_hostname_when_set() {
        let config = Config::try_parse_from([
            "ddui",
            "--database-url",
            "postgres://localhost/ddui",
            "--hostname",
            "0.0.0.0",
            "--port",
            "9000",
        ])
        .unwrap();
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_rejects_boost_interval_longer_than_base() {
        let err = Config::try_parse_from([
            "ddui",
            "--database-url",
            "postgres://localhost/ddui",
            "--scan-base-interval-ms",
            "100",
            "--scan-boost-interval-ms",
            "200",
        ]);
        // clap parsing succeeds; validation happens in Config::parse().
        let config = err.unwrap();
        assert!(config.validate().is_err());
    }
}
