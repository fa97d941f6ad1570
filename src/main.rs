//! ncrelay - netcat-style relay between one network connection and stdin/stdout.

use clap::{CommandFactory, Parser};
use ncrelay::{normalize_args, run_relay, Cli, Config};
use tracing_subscriber::EnvFilter;

const TOOL_NAME: &str = "ncrelay";

fn main() {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));

    // Logging goes to stderr so it never mixes with relayed bytes on stdout.
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::try_from(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", TOOL_NAME, e);
            eprintln!("{}", Cli::command().render_usage());
            std::process::exit(e.exit_code().into());
        }
    };
    tracing::debug!(?config, "configuration");

    let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    let result = runtime.block_on(run_relay(
        &config,
        tokio::io::stdin(),
        tokio::io::stdout(),
        tokio::io::stderr(),
    ));

    // The stdin reader blocks on a thread that cannot be interrupted; don't
    // wait for it.
    runtime.shutdown_background();

    if let Err(e) = result {
        tracing::debug!(error = ?e, "relay failed");
        eprintln!("{}: {}", TOOL_NAME, e);
        std::process::exit(e.exit_code().into());
    }
}
