//! Transport selection and connection establishment.
//!
//! A run owns exactly one [`Connection`], obtained either from a one-shot
//! [`Listener`] or from [`dial`]. The connection is handed to the relay as an
//! owned read half and an owned write half so each copy direction can run on
//! its own task without locking.

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::common::{
    join_host_port, AddressFamily, DnsResolver, Purpose, MAX_UDP_PAYLOAD_V4, MAX_UDP_PAYLOAD_V6,
    READ_BUFFER_SIZE,
};
use crate::error::{Error, Result};

/// Transport and address family selected with `-net`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unix => "unix",
        }
    }

    /// IP family the network is restricted to. Unix sockets report `Any`.
    pub fn family(&self) -> AddressFamily {
        match self {
            Network::Tcp4 | Network::Udp4 => AddressFamily::V4,
            Network::Tcp6 | Network::Udp6 => AddressFamily::V6,
            Network::Tcp | Network::Udp | Network::Unix => AddressFamily::Any,
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "udp" => Ok(Network::Udp),
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            "unix" => Ok(Network::Unix),
            other => Err(Error::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned read half of a [`Connection`].
pub type ConnReader = Box<dyn AsyncRead + Send + Unpin>;

/// Owned write half of a [`Connection`].
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established duplex byte stream.
pub struct Connection {
    peer_addr: String,
    reader: ConnReader,
    writer: ConnWriter,
}

impl Connection {
    fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        // Interactive traffic: don't hold back small writes.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        Self {
            peer_addr: display_addr(peer),
            reader: Box::new(read_half),
            writer: Box::new(write_half),
        }
    }

    /// Wraps a connected UDP socket. `first` is a datagram already received
    /// from the peer that must be read before anything else.
    fn from_udp(socket: UdpSocket, peer: SocketAddr, first: Option<Bytes>) -> Self {
        let socket = Arc::new(socket);
        let max_payload = if peer.ip().to_canonical().is_ipv4() {
            MAX_UDP_PAYLOAD_V4
        } else {
            MAX_UDP_PAYLOAD_V6
        };
        Self {
            peer_addr: display_addr(peer),
            reader: Box::new(UdpReader {
                socket: Arc::clone(&socket),
                pending: first,
            }),
            writer: Box::new(UdpWriter {
                socket,
                max_payload,
            }),
        }
    }

    #[cfg(unix)]
    fn from_unix(stream: UnixStream, peer_addr: String) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            peer_addr,
            reader: Box::new(read_half),
            writer: Box::new(write_half),
        }
    }

    /// Address of the remote peer, formatted for display.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Splits the connection into independently owned halves.
    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }
}

/// Formats a peer address, showing IPv4-mapped IPv6 peers of a dual-stack
/// socket in their IPv4 form.
fn display_addr(addr: SocketAddr) -> String {
    match addr.ip().to_canonical() {
        IpAddr::V4(ip) => SocketAddr::new(IpAddr::V4(ip), addr.port()).to_string(),
        IpAddr::V6(_) => addr.to_string(),
    }
}

/// Read half of a connected UDP socket. Every read yields one datagram.
struct UdpReader {
    socket: Arc<UdpSocket>,
    pending: Option<Bytes>,
}

impl AsyncRead for UdpReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut pending) = self.pending.take() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending.split_to(n));
            if !pending.is_empty() {
                self.pending = Some(pending);
            }
            return Poll::Ready(Ok(()));
        }
        self.socket.poll_recv(cx, buf)
    }
}

/// Write half of a connected UDP socket. Every write is sent as one datagram
/// of at most `max_payload` bytes; `write_all` sends the rest in further
/// datagrams.
struct UdpWriter {
    socket: Arc<UdpSocket>,
    max_payload: usize,
}

impl AsyncWrite for UdpWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let len = buf.len().min(self.max_payload);
        self.socket.poll_send(cx, &buf[..len])
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Unix listener that removes its socket file when dropped.
#[cfg(unix)]
struct UnixSocketListener {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %e, "failed to remove unix socket");
        }
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixSocketListener),
}

/// A bound endpoint that accepts exactly one connection.
///
/// [`Listener::accept`] consumes the listener, so the endpoint is released as
/// soon as the single session has been established.
pub struct Listener {
    network: Network,
    addr: String,
    inner: ListenerInner,
}

impl Listener {
    /// Binds `network` on `host`/`port`.
    pub async fn bind(
        network: Network,
        host: &str,
        port: &str,
        resolver: &DnsResolver,
    ) -> Result<Self> {
        let addr = join_host_port(host, port);
        let listen_failed = |source: io::Error| Error::ListenFailed {
            network: network.to_string(),
            addr: addr.clone(),
            source,
        };

        let inner = match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let addrs = resolver
                    .resolve(host, port, network.family(), Purpose::Listen)
                    .await?;
                ListenerInner::Tcp(TcpListener::bind(addrs.as_slice()).await.map_err(listen_failed)?)
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                let addrs = resolver
                    .resolve(host, port, network.family(), Purpose::Listen)
                    .await?;
                ListenerInner::Udp(UdpSocket::bind(addrs.as_slice()).await.map_err(listen_failed)?)
            }
            #[cfg(unix)]
            Network::Unix => {
                let path = PathBuf::from(&addr);
                let listener = UnixListener::bind(&path).map_err(listen_failed)?;
                ListenerInner::Unix(UnixSocketListener { listener, path })
            }
            #[cfg(not(unix))]
            Network::Unix => return Err(Error::UnknownNetwork(network.to_string())),
        };

        tracing::debug!(%network, %addr, "listener bound");
        Ok(Self {
            network,
            addr,
            inner,
        })
    }

    /// The address actually bound, with ephemeral ports filled in.
    pub fn local_addr(&self) -> String {
        let bound = match &self.inner {
            ListenerInner::Tcp(listener) => listener.local_addr().map(|a| a.to_string()),
            ListenerInner::Udp(socket) => socket.local_addr().map(|a| a.to_string()),
            #[cfg(unix)]
            ListenerInner::Unix(unix) => Ok(unix.path.display().to_string()),
        };
        bound.unwrap_or_else(|_| self.addr.clone())
    }

    /// Waits for one peer and returns the connection to it.
    ///
    /// For UDP the first datagram received selects the peer; the socket is
    /// then connected to it and that datagram is delivered as the first bytes
    /// read from the connection.
    pub async fn accept(self, timeout: Option<Duration>) -> Result<Connection> {
        let network = self.network.to_string();
        let addr = self.addr.clone();
        let (failed_network, failed_addr) = (network.clone(), addr.clone());

        let accepted = async move {
            self.accept_one()
                .await
                .map_err(|source| Error::AcceptFailed {
                    network: failed_network,
                    addr: failed_addr,
                    source,
                })
        };

        with_deadline(timeout, accepted, || Error::Timeout {
            op: "accept",
            network,
            addr,
        })
        .await
    }

    async fn accept_one(self) -> io::Result<Connection> {
        match self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Connection::from_tcp(stream, peer))
            }
            ListenerInner::Udp(socket) => {
                let mut buf = vec![0u8; READ_BUFFER_SIZE];
                let (n, peer) = socket.recv_from(&mut buf).await?;
                socket.connect(peer).await?;
                let first = Bytes::copy_from_slice(&buf[..n]);
                Ok(Connection::from_udp(socket, peer, Some(first)))
            }
            #[cfg(unix)]
            ListenerInner::Unix(unix) => {
                let (stream, peer) = unix.listener.accept().await?;
                let peer_addr = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "@".to_string());
                Ok(Connection::from_unix(stream, peer_addr))
            }
        }
    }
}

/// Opens one outbound connection to `host`/`port` over `network`.
///
/// TCP tries each resolved address in turn and reports the last failure.
pub async fn dial(
    network: Network,
    host: &str,
    port: &str,
    resolver: &DnsResolver,
    timeout: Option<Duration>,
) -> Result<Connection> {
    let addr = join_host_port(host, port);
    let connecting = dial_one(network, host, port, &addr, resolver);

    with_deadline(timeout, connecting, || Error::Timeout {
        op: "dial",
        network: network.to_string(),
        addr: addr.clone(),
    })
    .await
}

async fn dial_one(
    network: Network,
    host: &str,
    port: &str,
    addr: &str,
    resolver: &DnsResolver,
) -> Result<Connection> {
    let dial_failed = |source: io::Error| Error::DialFailed {
        network: network.to_string(),
        addr: addr.to_string(),
        source,
    };

    match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let targets = resolver
                .resolve(host, port, network.family(), Purpose::Dial)
                .await?;
            let mut last_err = None;
            for target in targets {
                match TcpStream::connect(target).await {
                    Ok(stream) => return Ok(Connection::from_tcp(stream, target)),
                    Err(e) => {
                        tracing::debug!(%target, error = %e, "connect attempt failed");
                        last_err = Some(e);
                    }
                }
            }
            Err(dial_failed(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no addresses to dial")
            })))
        }
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let targets = resolver
                .resolve(host, port, network.family(), Purpose::Dial)
                .await?;
            let Some(&target) = targets.first() else {
                return Err(dial_failed(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no addresses to dial",
                )));
            };
            let local: SocketAddr = if target.is_ipv4() {
                SocketAddr::from(([0u8; 4], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = UdpSocket::bind(local).await.map_err(dial_failed)?;
            socket.connect(target).await.map_err(dial_failed)?;
            Ok(Connection::from_udp(socket, target, None))
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = UnixStream::connect(addr).await.map_err(dial_failed)?;
            Ok(Connection::from_unix(stream, addr.to_string()))
        }
        #[cfg(not(unix))]
        Network::Unix => Err(Error::UnknownNetwork(network.to_string())),
    }
}

/// Runs `fut`, failing with `on_timeout()` if `timeout` elapses first.
async fn with_deadline<T, F>(
    timeout: Option<Duration>,
    fut: F,
    on_timeout: impl FnOnce() -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout()),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_network_from_str() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(Error::UnknownNetwork(name)) if name == "sctp"
        ));
    }

    #[test]
    fn test_network_family() {
        assert_eq!(Network::Tcp.family(), AddressFamily::Any);
        assert_eq!(Network::Udp4.family(), AddressFamily::V4);
        assert_eq!(Network::Tcp6.family(), AddressFamily::V6);
    }

    #[test]
    fn test_network_display_round_trips() {
        for name in ["tcp", "tcp4", "tcp6", "udp", "udp4", "udp6", "unix"] {
            assert_eq!(name.parse::<Network>().unwrap().to_string(), name);
        }
    }

    #[tokio::test]
    async fn test_tcp_listener_reports_ephemeral_port() {
        let resolver = DnsResolver::new();
        let listener = Listener::bind(Network::Tcp, "127.0.0.1", "0", &resolver)
            .await
            .unwrap();
        let local: SocketAddr = listener.local_addr().parse().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let resolver = DnsResolver::new();
        let listener = Listener::bind(Network::Tcp, "127.0.0.1", "0", &resolver)
            .await
            .unwrap();
        let result = listener.accept(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(Error::Timeout { op: "accept", .. })));
    }

    #[tokio::test]
    async fn test_udp_accept_delivers_first_datagram() {
        let resolver = DnsResolver::new();
        let listener = Listener::bind(Network::Udp, "127.0.0.1", "0", &resolver)
            .await
            .unwrap();
        let local: SocketAddr = listener.local_addr().parse().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"first", local).await.unwrap();

        let conn = listener.accept(None).await.unwrap();
        assert_eq!(conn.peer_addr(), peer.local_addr().unwrap().to_string());

        let (mut reader, mut writer) = conn.into_split();
        let mut buf = [0u8; 64];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");

        peer.send_to(b"second", local).await.unwrap();
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");

        writer.write_all(b"reply").await.unwrap();
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, local);
    }

    #[tokio::test]
    async fn test_udp_pending_datagram_larger_than_read_buffer() {
        let resolver = DnsResolver::new();
        let listener = Listener::bind(Network::Udp4, "127.0.0.1", "0", &resolver)
            .await
            .unwrap();
        let local: SocketAddr = listener.local_addr().parse().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"abcdef", local).await.unwrap();

        let (mut reader, _writer) = listener.accept(None).await.unwrap().into_split();
        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_udp_write_is_capped_at_one_datagram() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port().to_string();
        let resolver = DnsResolver::new();

        let (_reader, mut writer) = dial(Network::Udp, "127.0.0.1", &port, &resolver, None)
            .await
            .unwrap()
            .into_split();

        let payload = vec![7u8; READ_BUFFER_SIZE];
        let n = writer.write(&payload).await.unwrap();
        assert_eq!(n, MAX_UDP_PAYLOAD_V4);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(n, MAX_UDP_PAYLOAD_V4);
    }

    #[tokio::test]
    async fn test_listen_empty_host_accepts_ipv4_peer() {
        let resolver = DnsResolver::new();
        let listener = Listener::bind(Network::Tcp, "", "0", &resolver)
            .await
            .unwrap();
        let local: SocketAddr = listener.local_addr().parse().unwrap();
        assert!(local.ip().is_unspecified());

        let (accepted, stream) = tokio::join!(
            listener.accept(Some(Duration::from_secs(5))),
            TcpStream::connect(("127.0.0.1", local.port()))
        );
        let stream = stream.unwrap();
        assert_eq!(
            accepted.unwrap().peer_addr(),
            stream.local_addr().unwrap().to_string()
        );
    }

    #[tokio::test]
    async fn test_dial_tcp_refused() {
        let port = {
            let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
            reserved.local_addr().unwrap().port()
        };
        let resolver = DnsResolver::new();
        let result = dial(Network::Tcp, "127.0.0.1", &port.to_string(), &resolver, None).await;
        assert!(matches!(result, Err(Error::DialFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("relay.sock").display().to_string();
        let resolver = DnsResolver::new();

        let listener = Listener::bind(Network::Unix, &host, "0", &resolver)
            .await
            .unwrap();
        let path = PathBuf::from(listener.local_addr());
        assert_eq!(path, PathBuf::from(format!("{}:0", host)));
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
