//! Run configuration built from the command line.

use std::time::Duration;

use crate::cli::Cli;
use crate::common::join_host_port;
use crate::error::{Error, Result};

/// Network used when `-net` is not given.
pub const DEFAULT_NETWORK: &str = "tcp";

/// Immutable description of one relay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Transport name (`tcp`, `udp6`, `unix`, ...). Validated when the run
    /// starts, not here.
    pub network: String,
    /// Accept one connection instead of dialing.
    pub listen: bool,
    /// Write status lines to the diagnostic channel.
    pub verbose: bool,
    /// Shut down the connection's write side once stdin reaches EOF.
    pub half_close: bool,
    /// Deadline for dial or accept. `None` waits forever.
    pub timeout: Option<Duration>,
    pub host: String,
    pub port: String,
}

impl Config {
    /// A connect-mode TCP configuration for `host`/`port`.
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            listen: false,
            verbose: false,
            half_close: false,
            timeout: None,
            host: host.into(),
            port: port.into(),
        }
    }

    /// Host and port joined into one address string.
    pub fn address(&self) -> String {
        join_host_port(&self.host, &self.port)
    }
}

/// Builds a configuration from parsed arguments.
///
/// Exactly two positional arguments (host and port) are required.
impl TryFrom<&Cli> for Config {
    type Error = Error;

    fn try_from(cli: &Cli) -> Result<Self> {
        let [host, port] = cli.address.as_slice() else {
            return Err(Error::MissingHostnameOrPort);
        };

        Ok(Self {
            network: cli.network.clone(),
            listen: cli.listen,
            verbose: cli.verbose,
            half_close: cli.half_close,
            timeout: cli.timeout,
            host: host.clone(),
            port: port.clone(),
        })
    }
}
