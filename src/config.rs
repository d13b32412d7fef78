//! Process configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TOOLBRIDGE_DATA_DIR` | `$HOME/.toolbridge` |
//! | `TOOLBRIDGE_SERVICE_NAME` | host name, else `toolbridge` |
//! | `TOOLBRIDGE_SERVICE_TYPE` | `_mcp._tcp.local.` |
//! | `TOOLBRIDGE_PORT` | `0` (ephemeral) |
//! | `TOOLBRIDGE_BIND` | `0.0.0.0` |
//! | `TOOLBRIDGE_HANDSHAKE_TIMEOUT_SECS` | `10` |
//! | `TOOLBRIDGE_APPROVAL_TIMEOUT_SECS` | unset (prompts wait forever) |
//! | `TOOLBRIDGE_ADVERTISE` | `true` |
//! | `TOOLBRIDGE_FILES_ROOT` | current directory |

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::approval::ApprovalConfig;
use crate::discovery::{DiscoveryConfig, DEFAULT_SERVICE_TYPE};
use crate::manager::HANDSHAKE_TIMEOUT;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub files_root: PathBuf,
    pub advertise: bool,
    pub handshake_timeout: Duration,
    pub discovery: DiscoveryConfig,
    pub approval: ApprovalConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = match lookup("TOOLBRIDGE_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").unwrap_or_else(|| ".".to_string());
                PathBuf::from(home).join(".toolbridge")
            }
        };

        let files_root = match lookup("TOOLBRIDGE_FILES_ROOT") {
            Some(root) => PathBuf::from(root),
            None => std::env::current_dir().context("Failed to resolve current directory")?,
        };

        let mut discovery = DiscoveryConfig {
            instance_name: sysinfo::System::host_name()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            ..DiscoveryConfig::default()
        };
        if let Some(name) = lookup("TOOLBRIDGE_SERVICE_NAME") {
            discovery.instance_name = name;
        }
        if let Some(service_type) = lookup("TOOLBRIDGE_SERVICE_TYPE") {
            discovery.service_type = service_type;
        }
        if let Some(port) = lookup("TOOLBRIDGE_PORT") {
            discovery.port = port
                .parse()
                .with_context(|| format!("Invalid TOOLBRIDGE_PORT: {}", port))?;
        }
        if let Some(bind) = lookup("TOOLBRIDGE_BIND") {
            discovery.bind_addr = bind
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid TOOLBRIDGE_BIND: {}", bind))?;
        }

        let handshake_timeout = match lookup("TOOLBRIDGE_HANDSHAKE_TIMEOUT_SECS") {
            Some(secs) => parse_secs("TOOLBRIDGE_HANDSHAKE_TIMEOUT_SECS", &secs)?,
            None => HANDSHAKE_TIMEOUT,
        };
        let prompt_timeout = lookup("TOOLBRIDGE_APPROVAL_TIMEOUT_SECS")
            .map(|secs| parse_secs("TOOLBRIDGE_APPROVAL_TIMEOUT_SECS", &secs))
            .transpose()?;
        let advertise = match lookup("TOOLBRIDGE_ADVERTISE") {
            Some(value) => parse_bool("TOOLBRIDGE_ADVERTISE", &value)?,
            None => true,
        };

        Ok(Self {
            data_dir,
            files_root,
            advertise,
            handshake_timeout,
            discovery,
            approval: ApprovalConfig { prompt_timeout },
        })
    }
}

fn parse_secs(key: &str, value: &str) -> anyhow::Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))?;
    if secs == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("Invalid {}: {}", key, value),
    }
}
