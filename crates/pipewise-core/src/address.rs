// ABOUTME: Control endpoint addresses for supervised workers.
// ABOUTME: Parses and renders tcp://host:port and ipc://path forms.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Host a worker binds when it listens on every interface.
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Errors from parsing a control address.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("unsupported control address scheme in '{0}' (expected tcp:// or ipc://)")]
    UnsupportedScheme(String),

    #[error("control address '{0}' is missing a port")]
    MissingPort(String),

    #[error("invalid port in control address '{0}'")]
    InvalidPort(String),
}

/// Where a worker's control endpoint can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddress {
    Tcp { host: String, port: u16 },
    Ipc(PathBuf),
}

impl ControlAddress {
    /// Build the control address for a worker bound on `host:port`.
    ///
    /// With `with_ipc` the endpoint is a unix socket in the temp dir keyed by port.
    pub fn for_worker(host: &str, port: u16, with_ipc: bool) -> Self {
        if with_ipc {
            Self::Ipc(std::env::temp_dir().join(format!("pipewise-ctrl-{port}.sock")))
        } else {
            Self::Tcp {
                host: host.to_string(),
                port,
            }
        }
    }

    /// Host:port to dial for TCP addresses. A wildcard bind host is dialed on loopback.
    pub fn dial_target(&self) -> Option<String> {
        match self {
            Self::Tcp { host, port } if host == WILDCARD_HOST => Some(format!("127.0.0.1:{port}")),
            Self::Tcp { host, port } => Some(format!("{host}:{port}")),
            Self::Ipc(_) => None,
        }
    }

    pub fn is_ipc(&self) -> bool {
        matches!(self, Self::Ipc(_))
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl FromStr for ControlAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(path) = trimmed.strip_prefix("ipc://") {
            return Ok(Self::Ipc(PathBuf::from(path)));
        }
        let rest = trimmed
            .strip_prefix("tcp://")
            .ok_or_else(|| AddressError::UnsupportedScheme(trimmed.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(trimmed.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(trimmed.to_string()))?;
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}
