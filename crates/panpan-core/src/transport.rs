//! Endpoint selection and raw byte connections to the daemon.
//!
//! On Unix the daemon listens on a domain socket at
//! `<home>/.panpan/daemon.sock`. Platforms without usable domain sockets use a
//! loopback TCP port instead (default [`DEFAULT_TCP_PORT`]). Which of the two
//! is used is decided by the target OS, not by the protocol.
//!
//! The lifecycle manager hands the chosen address to a spawned daemon through
//! [`SOCKET_ENV`] / [`PORT_ENV`], so both sides agree without a config file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};

/// Default loopback port on platforms without Unix domain sockets.
pub const DEFAULT_TCP_PORT: u16 = 19527;

/// Environment variable carrying the socket path to a spawned daemon.
pub const SOCKET_ENV: &str = "PANPAN_DAEMON_SOCKET";

/// Environment variable carrying the TCP port to a spawned daemon.
pub const PORT_ENV: &str = "PANPAN_DAEMON_PORT";

/// Read half of a daemon connection.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a daemon connection.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address the daemon listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// Loopback TCP port on 127.0.0.1.
    Tcp(u16),
}

impl Endpoint {
    /// The platform default: a socket under `<home>/.panpan` on Unix, the
    /// fixed loopback port elsewhere.
    pub fn default_for_platform(home: &Path) -> Self {
        Self::for_platform(home, None, None)
    }

    /// Platform endpoint with optional overrides for the socket path (Unix)
    /// or port (other platforms). The override for the other family is
    /// ignored.
    #[allow(unused_variables)]
    pub fn for_platform(home: &Path, socket_path: Option<PathBuf>, port: Option<u16>) -> Self {
        #[cfg(unix)]
        {
            Endpoint::Unix(socket_path.unwrap_or_else(|| crate::home::socket_path(home)))
        }

        #[cfg(not(unix))]
        {
            Endpoint::Tcp(port.unwrap_or(DEFAULT_TCP_PORT))
        }
    }

    /// Environment variables that hand this endpoint to a spawned daemon.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        match self {
            Endpoint::Unix(path) => vec![(SOCKET_ENV, path.to_string_lossy().into_owned())],
            Endpoint::Tcp(port) => vec![(PORT_ENV, port.to_string())],
        }
    }

    /// Open one connection and split it into boxed halves.
    pub async fn connect(&self) -> io::Result<(BoxReader, BoxWriter)> {
        match self {
            Endpoint::Unix(path) => connect_unix(path).await,
            Endpoint::Tcp(port) => {
                let stream = tokio::net::TcpStream::connect(("127.0.0.1", *port)).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }

    /// Bind a listener on this endpoint.
    ///
    /// For Unix sockets the caller is responsible for removing a stale socket
    /// file first.
    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listener::Unix(tokio::net::UnixListener::bind(path)?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unsupported_unix()),
            Endpoint::Tcp(port) => Ok(Listener::Tcp(
                tokio::net::TcpListener::bind(("127.0.0.1", *port)).await?,
            )),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(port) => write!(f, "tcp:127.0.0.1:{port}"),
        }
    }
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> io::Result<(BoxReader, BoxWriter)> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (r, w) = stream.into_split();
    Ok((Box::new(r), Box::new(w)))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &Path) -> io::Result<(BoxReader, BoxWriter)> {
    Err(unsupported_unix())
}

#[cfg(not(unix))]
fn unsupported_unix() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "Unix domain sockets are not available on this platform",
    )
}

/// A bound daemon listener.
pub enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

impl Listener {
    /// Accept the next connection and split it into boxed halves.
    pub async fn accept(&self) -> io::Result<(BoxReader, BoxWriter)> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
            Listener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w)))
            }
        }
    }

    /// Local port for TCP listeners (useful when bound to port 0 in tests).
    pub fn local_port(&self) -> Option<u16> {
        match self {
            #[cfg(unix)]
            Listener::Unix(_) => None,
            Listener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
        }
    }
}
