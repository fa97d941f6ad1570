//! CLI definitions for ncrelay.

use clap::{builder::PossibleValuesParser, Parser};
use std::ffi::OsString;
use std::time::Duration;

use crate::config::DEFAULT_NETWORK;

/// Default log level. Kept quiet so tracing output never mixes with relayed data.
pub const DEFAULT_LOG_LEVEL: &str = "error";

/// Long flags that may also be written with a single dash (`-net udp`).
const SINGLE_DASH_LONG_FLAGS: &[&str] = &["net", "timeout", "log-level", "half-close"];

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Relay bytes between one TCP, UDP, or Unix socket connection and stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "ncrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    /// What net type to use, e.g. tcp, udp, unix
    #[arg(long = "net", value_name = "NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Listen for one connection instead of dialing
    #[arg(short, long, default_value_t = false)]
    pub listen: bool,

    /// Verbose output
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Shut down the network write side after EOF on stdin
    #[arg(short = 'N', long, default_value_t = false)]
    pub half_close: bool,

    /// Dial or accept timeout (e.g. 5s, 500ms); waits forever when unset
    #[arg(short = 'w', long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Host and port to dial, or to bind in listen mode
    #[arg(value_name = "HOST_PORT", num_args = 0..)]
    pub address: Vec<String>,
}

/// Rewrites single-dash long flags (`-net`, `-net=udp`) to their `--` form.
///
/// Everything after a literal `--` is left untouched.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut past_terminator = false;
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if past_terminator {
                return arg;
            }
            if arg == "--" {
                past_terminator = true;
                return arg;
            }
            match arg.to_str() {
                Some(s) if is_single_dash_long_flag(s) => OsString::from(format!("-{}", s)),
                _ => arg,
            }
        })
        .collect()
}

fn is_single_dash_long_flag(arg: &str) -> bool {
    let Some(rest) = arg.strip_prefix('-') else {
        return false;
    };
    if rest.starts_with('-') {
        return false;
    }
    let name = rest.split_once('=').map_or(rest, |(name, _)| name);
    SINGLE_DASH_LONG_FLAGS.contains(&name)
}
