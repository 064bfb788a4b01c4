//! Upstream target configuration as deposited by the approval actor, and the
//! resolved upstream identity handed back to the connection host.

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Port used when the configured host carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One upstream entry of a pipe config.
///
/// While stored in a session, `password` and `private_key_data` are
/// envelopes sealed under that session's key, never plaintext.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Base64 of the private key file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_data: String,
    /// Base64 of known_hosts text; empty disables host key checking
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub known_hosts_data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,
    /// Where this entry was loaded from
    #[serde(skip)]
    pub repo: String,
}

/// The pipe config document users keep alongside their repositories.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipeConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl PipeConfig {
    /// Parse a YAML pipe config, tagging every upstream with its origin.
    pub fn from_yaml(source: &str, repo: &str) -> BrokerResult<Self> {
        let mut config: PipeConfig = serde_yaml::from_str(source)
            .map_err(|e| BrokerError::InvalidPipeConfig(format!("{}: {}", repo, e)))?;
        for upstream in &mut config.upstreams {
            upstream.repo = repo.to_string();
        }
        Ok(config)
    }
}

/// Credential chosen for the outbound connection.
#[derive(Clone, PartialEq, Eq)]
pub enum UpstreamAuth {
    PrivateKey(Zeroizing<Vec<u8>>),
    Password(Zeroizing<String>),
    None,
}

impl UpstreamAuth {
    pub fn method(&self) -> &'static str {
        match self {
            Self::PrivateKey(_) => "private key",
            Self::Password(_) => "password",
            Self::None => "none auth",
        }
    }
}

impl std::fmt::Debug for UpstreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UpstreamAuth({})", self.method())
    }
}

/// Resolved upstream identity returned from keyboard-interactive auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: UpstreamAuth,
    pub ignore_host_key: bool,
}

/// Split `host`, `host:port` or `[v6]:port` into host and port, defaulting to 22.
pub fn split_host_port(addr: &str) -> BrokerResult<(String, u16)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(BrokerError::InvalidUpstream("empty addr".to_string()));
    }

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| BrokerError::InvalidUpstream(format!("missing ']' in address {}", addr)))?;
        let host = &rest[..end];
        match &rest[end + 1..] {
            "" => (host, None),
            tail => match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => {
                    return Err(BrokerError::InvalidUpstream(format!(
                        "unexpected text after ']' in address {}",
                        addr
                    )))
                }
            },
        }
    } else {
        match addr.matches(':').count() {
            0 => (addr, None),
            1 => {
                let (host, port) = addr.split_once(':').unwrap_or((addr, ""));
                (host, Some(port))
            }
            _ => {
                return Err(BrokerError::InvalidUpstream(format!(
                    "too many colons in address {}",
                    addr
                )))
            }
        }
    };

    if host.is_empty() {
        return Err(BrokerError::InvalidUpstream(format!("missing host in address {}", addr)));
    }

    let port = match port {
        None => DEFAULT_SSH_PORT,
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| BrokerError::InvalidUpstream(format!("invalid port {:?} in address {}", p, addr)))?,
    };

    Ok((host.to_string(), port))
}
