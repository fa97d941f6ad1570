//! ncrelay - netcat-style relay between one network connection and stdin/stdout.
//!
//! A run either dials one TCP, UDP, or Unix socket connection or accepts
//! exactly one, then copies bytes in both directions until the peer closes.

pub mod cli;
pub mod common;
pub mod config;
pub mod error;
pub mod net;
pub mod relay;

pub use cli::{normalize_args, Cli};
pub use common::{join_host_port, AddressFamily, DnsResolver, Purpose, READ_BUFFER_SIZE};
pub use config::{Config, DEFAULT_NETWORK};
pub use error::{Error, ExitCode, Result};
pub use net::{dial, Connection, Listener, Network};
pub use relay::{run_relay, Diagnostics};
