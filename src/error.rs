//! Error types for ncrelay.

use std::io;
use thiserror::Error;

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Generic failure
    Failure = 1,
    /// Invalid command line
    Usage = 2,
    /// Bind or accept failed
    ListenFailed = 10,
    /// Outbound connection failed
    DialFailed = 11,
    /// Dial or accept deadline elapsed
    Timeout = 12,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Main error type for ncrelay.
///
/// Only failures to establish the connection are represented here. Errors
/// that happen while bytes are being relayed are reported on the diagnostic
/// channel and never surface as an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing hostname or port")]
    MissingHostnameOrPort,

    #[error("unknown network {0}")]
    UnknownNetwork(String),

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("lookup {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("listen {network} {addr}: {source}")]
    ListenFailed {
        network: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept {network} {addr}: {source}")]
    AcceptFailed {
        network: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("dial {network} {addr}: {source}")]
    DialFailed {
        network: String,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{op} {network} {addr}: i/o timeout")]
    Timeout {
        op: &'static str,
        network: String,
        addr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::MissingHostnameOrPort => ExitCode::Usage,
            Error::ListenFailed { .. } | Error::AcceptFailed { .. } => ExitCode::ListenFailed,
            Error::DialFailed { .. } => ExitCode::DialFailed,
            Error::Timeout { .. } => ExitCode::Timeout,
            Error::UnknownNetwork(_)
            | Error::InvalidAddress { .. }
            | Error::Resolve { .. }
            | Error::Io(_) => ExitCode::Failure,
        }
    }
}

/// Result type alias for ncrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_hostname_or_port_is_a_usage_error() {
        let err = Error::MissingHostnameOrPort;
        assert_eq!(err.exit_code(), ExitCode::Usage);
        assert_eq!(err.to_string(), "missing hostname or port");
    }

    #[test]
    fn establishment_errors_map_to_distinct_exit_codes() {
        let listen = Error::ListenFailed {
            network: "tcp".to_string(),
            addr: "127.0.0.1:80".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let dial = Error::DialFailed {
            network: "tcp".to_string(),
            addr: "127.0.0.1:80".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let timeout = Error::Timeout {
            op: "dial",
            network: "tcp".to_string(),
            addr: "10.0.0.1:80".to_string(),
        };

        assert_eq!(listen.exit_code(), ExitCode::ListenFailed);
        assert_eq!(dial.exit_code(), ExitCode::DialFailed);
        assert_eq!(timeout.exit_code(), ExitCode::Timeout);
        assert_eq!(i32::from(dial.exit_code()), 11);
    }

    #[test]
    fn dial_error_display_names_network_and_address() {
        let err = Error::DialFailed {
            network: "udp".to_string(),
            addr: "[::1]:53".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("dial udp [::1]:53: "));
    }

    #[test]
    fn timeout_display() {
        let err = Error::Timeout {
            op: "accept",
            network: "tcp".to_string(),
            addr: ":0".to_string(),
        };
        assert_eq!(err.to_string(), "accept tcp :0: i/o timeout");
    }
}
