//! Relay between one network connection and the standard streams.
//!
//! Two copy loops run per session:
//!
//! - stdin -> connection, on a spawned background task. Its failures are
//!   reported on the diagnostic channel and never returned.
//! - connection -> stdout, on the calling task. Its end (peer EOF or error)
//!   ends the session.
//!
//! The session does not wait for stdin to close. A terminal rarely sends EOF,
//! so the relay returns as soon as the peer hangs up.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::common::{DnsResolver, READ_BUFFER_SIZE};
use crate::config::Config;
use crate::error::Result;
use crate::net::{dial, Connection, ConnWriter, Listener, Network};

/// Line-oriented diagnostic channel (normally stderr).
///
/// Cloned into the background copy task; each line is written under a lock
/// so status and error lines never interleave.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl Diagnostics {
    pub fn new<E>(sink: E) -> Self
    where
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    /// Writes `msg` followed by a newline. Write failures are only traced.
    pub async fn line(&self, msg: String) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.write_all(format!("{}\n", msg).as_bytes()).await {
            tracing::debug!(error = %e, "failed to write diagnostic line");
            return;
        }
        if let Err(e) = sink.flush().await {
            tracing::debug!(error = %e, "failed to flush diagnostic channel");
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one relay session.
///
/// Establishes the connection described by `config` (listen or dial), then
/// copies `stdin` to the connection and the connection to `stdout` until the
/// connection reaches EOF or fails. Status lines (`verbose`) and transfer
/// errors go to `stderr`.
///
/// Only failures to establish the connection are returned. When this returns
/// the background stdin task has been aborted and every socket it owned has
/// been released.
pub async fn run_relay<R, W, E>(config: &Config, stdin: R, mut stdout: W, stderr: E) -> Result<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Unpin,
    E: AsyncWrite + Send + Unpin + 'static,
{
    let diagnostics = Diagnostics::new(stderr);
    let conn = establish(config, &diagnostics).await?;

    if config.verbose {
        diagnostics
            .line(format!("Connected to {}", conn.peer_addr()))
            .await;
    }
    tracing::debug!(peer = %conn.peer_addr(), "session started");

    let (conn_reader, conn_writer) = conn.into_split();

    let upstream = AbortOnDrop(tokio::spawn(copy_stdin(
        stdin,
        conn_writer,
        config.half_close,
        diagnostics.clone(),
    )));

    match pipe(conn_reader, &mut stdout).await {
        Ok(n) => tracing::debug!(bytes = n, "connection reached EOF"),
        Err(e) => {
            tracing::warn!(error = %e, "connection -> stdout failed");
            diagnostics.line(e.to_string()).await;
        }
    }

    drop(upstream);

    if config.verbose {
        diagnostics.line("Disconnected".to_string()).await;
    }

    Ok(())
}

/// Listens or dials according to `config`.
async fn establish(config: &Config, diagnostics: &Diagnostics) -> Result<Connection> {
    let network: Network = config.network.parse()?;
    let resolver = DnsResolver::new();

    if config.listen {
        let listener = Listener::bind(network, &config.host, &config.port, &resolver).await?;
        if config.verbose {
            diagnostics
                .line(format!("Listening on {}", listener.local_addr()))
                .await;
        }
        listener.accept(config.timeout).await
    } else {
        dial(network, &config.host, &config.port, &resolver, config.timeout).await
    }
}

/// Background direction: stdin -> connection.
///
/// Without `half_close` the write half is held open after stdin EOF until
/// the session ends, since dropping a stream write half shuts it down.
async fn copy_stdin<R>(
    stdin: R,
    mut conn_writer: ConnWriter,
    half_close: bool,
    diagnostics: Diagnostics,
) where
    R: AsyncRead + Unpin,
{
    match pipe(stdin, &mut conn_writer).await {
        Ok(n) => {
            tracing::debug!(bytes = n, "stdin reached EOF");
            if half_close {
                if let Err(e) = conn_writer.shutdown().await {
                    diagnostics.line(e.to_string()).await;
                }
                return;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "stdin -> connection failed");
            diagnostics.line(e.to_string()).await;
            return;
        }
    }

    std::future::pending::<()>().await;
}

/// Copies `reader` into `writer` until EOF, flushing after every chunk.
///
/// Returns the number of bytes copied.
async fn pipe<R, W>(mut reader: R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_pipe_copies_everything_in_order() {
        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut output: Vec<u8> = Vec::new();

        let n = pipe(Cursor::new(input.clone()), &mut output).await.unwrap();

        assert_eq!(n, input.len() as u64);
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_pipe_empty_input() {
        let mut output: Vec<u8> = Vec::new();
        let n = pipe(Cursor::new(Vec::<u8>::new()), &mut output).await.unwrap();
        assert_eq!(n, 0);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_lines_are_newline_terminated() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let diagnostics = Diagnostics::new(writer);

        diagnostics.line("Listening on 127.0.0.1:1".to_string()).await;
        diagnostics.clone().line(format!("Connected to {}", "peer")).await;
        drop(diagnostics);

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "Listening on 127.0.0.1:1\nConnected to peer\n");
    }

    #[tokio::test]
    async fn test_unknown_network_fails_before_any_io() {
        let config = Config {
            network: "carrier-pigeon".to_string(),
            ..Config::new("127.0.0.1", "1")
        };
        let mut stdout: Vec<u8> = Vec::new();
        let result = run_relay(&config, Cursor::new(Vec::<u8>::new()), &mut stdout, tokio::io::sink()).await;

        assert!(matches!(
            result,
            Err(crate::error::Error::UnknownNetwork(name)) if name == "carrier-pigeon"
        ));
        assert!(stdout.is_empty());
    }
}
