//! Opening connections from transport addresses

use crate::connection::{Connection, ConnectionConfig};
use crate::tls::build_tls_connector;
use rustls::pki_types::ServerName;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("Invalid transport address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported transport on this platform: {0}")]
    Unsupported(String),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how to reach a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportAddress {
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
    /// `tls://host:port`
    Tls { host: String, port: u16 },
    /// `namedpipe://host/pipe`
    NamedPipe { host: String, pipe: String },
    /// `unix:///path/to/socket`
    Unix(PathBuf),
}

impl TransportAddress {
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportAddress::Tcp { .. } => "tcp",
            TransportAddress::Tls { .. } => "tls",
            TransportAddress::NamedPipe { .. } => "namedpipe",
            TransportAddress::Unix(_) => "unix",
        }
    }
}

fn parse_host_port(rest: &str, raw: &str) -> Result<(String, u16), DialError> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| DialError::InvalidAddress(raw.to_string()))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(DialError::InvalidAddress(raw.to_string()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| DialError::InvalidAddress(raw.to_string()))?;

    Ok((host.to_string(), port))
}

impl FromStr for TransportAddress {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| DialError::InvalidAddress(s.to_string()))?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = parse_host_port(rest, s)?;
                Ok(TransportAddress::Tcp { host, port })
            }
            "tls" => {
                let (host, port) = parse_host_port(rest, s)?;
                Ok(TransportAddress::Tls { host, port })
            }
            "namedpipe" => {
                let (host, pipe) = rest
                    .split_once('/')
                    .filter(|(host, pipe)| !host.is_empty() && !pipe.is_empty())
                    .ok_or_else(|| DialError::InvalidAddress(s.to_string()))?;
                Ok(TransportAddress::NamedPipe {
                    host: host.to_string(),
                    pipe: pipe.to_string(),
                })
            }
            "unix" if !rest.is_empty() => Ok(TransportAddress::Unix(PathBuf::from(rest))),
            _ => Err(DialError::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Tcp { host, port } | TransportAddress::Tls { host, port } => {
                if host.contains(':') {
                    write!(f, "{}://[{}]:{}", self.scheme(), host, port)
                } else {
                    write!(f, "{}://{}:{}", self.scheme(), host, port)
                }
            }
            TransportAddress::NamedPipe { host, pipe } => write!(f, "namedpipe://{}/{}", host, pipe),
            TransportAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Open a link to `address` and start a connection over it
pub async fn dial(
    address: &TransportAddress,
    config: ConnectionConfig,
) -> Result<Arc<Connection>, DialError> {
    debug!("Dialing {}", address);

    match address {
        TransportAddress::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let remote_addr = stream.peer_addr()?.to_string();
            Ok(Connection::start(stream, remote_addr, config))
        }
        TransportAddress::Tls { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            let remote_addr = stream.peer_addr()?.to_string();

            let server_name = ServerName::try_from(host.clone())
                .map_err(|_| DialError::InvalidServerName(host.clone()))?;
            let stream = build_tls_connector().connect(server_name, stream).await?;

            Ok(Connection::start(stream, remote_addr, config))
        }
        TransportAddress::NamedPipe { host, pipe } => dial_named_pipe(host, pipe, config).await,
        TransportAddress::Unix(path) => dial_unix(path, config).await,
    }
}

#[cfg(windows)]
async fn dial_named_pipe(
    host: &str,
    pipe: &str,
    config: ConnectionConfig,
) -> Result<Arc<Connection>, DialError> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let path = format!(r"\\{}\pipe\{}", host, pipe);
    let client = ClientOptions::new().open(&path)?;
    Ok(Connection::start(client, path, config))
}

#[cfg(not(windows))]
async fn dial_named_pipe(
    host: &str,
    pipe: &str,
    _config: ConnectionConfig,
) -> Result<Arc<Connection>, DialError> {
    Err(DialError::Unsupported(format!("namedpipe://{}/{}", host, pipe)))
}

#[cfg(unix)]
async fn dial_unix(path: &std::path::Path, config: ConnectionConfig) -> Result<Arc<Connection>, DialError> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Connection::start(stream, path.display().to_string(), config))
}

#[cfg(not(unix))]
async fn dial_unix(path: &std::path::Path, _config: ConnectionConfig) -> Result<Arc<Connection>, DialError> {
    Err(DialError::Unsupported(format!("unix://{}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr: TransportAddress = "tcp://10.0.0.5:8888".parse().unwrap();
        assert_eq!(
            addr,
            TransportAddress::Tcp {
                host: "10.0.0.5".to_string(),
                port: 8888
            }
        );
        assert_eq!(addr.to_string(), "tcp://10.0.0.5:8888");
    }

    #[test]
    fn test_parse_tls_ipv6() {
        let addr: TransportAddress = "tls://[::1]:443".parse().unwrap();
        assert_eq!(
            addr,
            TransportAddress::Tls {
                host: "::1".to_string(),
                port: 443
            }
        );
        assert_eq!(addr.to_string(), "tls://[::1]:443");
    }

    #[test]
    fn test_parse_named_pipe() {
        let addr: TransportAddress = "namedpipe://./outpost".parse().unwrap();
        assert_eq!(
            addr,
            TransportAddress::NamedPipe {
                host: ".".to_string(),
                pipe: "outpost".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unix() {
        let addr: TransportAddress = "unix:///tmp/outpost.sock".parse().unwrap();
        assert_eq!(addr, TransportAddress::Unix(PathBuf::from("/tmp/outpost.sock")));
    }

    #[test]
    fn test_parse_invalid() {
        for raw in [
            "10.0.0.5:8888",
            "tcp://10.0.0.5",
            "tcp://:80",
            "tcp://host:99999",
            "http://host:80",
            "namedpipe://host",
            "unix://",
        ] {
            assert!(
                matches!(raw.parse::<TransportAddress>(), Err(DialError::InvalidAddress(_))),
                "{} should not parse",
                raw
            );
        }
    }

    #[tokio::test]
    async fn test_dial_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let addr = TransportAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let (conn, accepted) = tokio::join!(dial(&addr, ConnectionConfig::default()), listener.accept());

        let conn = conn.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(conn.remote_addr(), listener.local_addr().unwrap().to_string());
        assert!(peer.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let addr = TransportAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let result = dial(&addr, ConnectionConfig::default()).await;
        assert!(matches!(result, Err(DialError::Io(_))));
    }
}
