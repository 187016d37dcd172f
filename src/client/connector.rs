//! Peer address resolution and connection setup.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use super::ClientError;
use crate::config::PeerConfig;

/// Opens TCP connections to peers named as `"host"` or `"host:port"`.
#[derive(Debug, Clone)]
pub struct Connector {
    default_port: u16,
    timeout: Duration,
}

impl Connector {
    pub fn new(default_port: u16, timeout: Duration) -> Self {
        Self {
            default_port,
            timeout,
        }
    }

    pub fn from_config(config: &PeerConfig) -> Self {
        Self::new(config.default_port, config.connect_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `peer`, using the default port when none is given.
    pub fn resolve(&self, peer: &str) -> Result<SocketAddr, ClientError> {
        if let Ok(addr) = peer.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = peer.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.default_port));
        }

        let has_port = matches!(
            peer.rsplit_once(':'),
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
        );
        let target = if has_port {
            peer.to_string()
        } else {
            format!("{}:{}", peer, self.default_port)
        };

        target
            .to_socket_addrs()
            .map_err(|_| ClientError::Resolve(peer.to_string()))?
            .next()
            .ok_or_else(|| ClientError::Resolve(peer.to_string()))
    }

    /// Blocking connect with the configured timeout.
    pub fn connect(&self, peer: &str) -> Result<TcpStream, ClientError> {
        let addr = self.resolve(peer)?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(|source| {
            warn!(peer, error = %source, "can't connect to peer");
            ClientError::Connect {
                peer: peer.to_string(),
                source,
            }
        })?;
        stream.set_nodelay(true)?;
        debug!(peer, %addr, "connected");
        Ok(stream)
    }

    /// Connect on the tokio runtime with the configured timeout.
    pub async fn connect_async(&self, peer: &str) -> Result<tokio::net::TcpStream, ClientError> {
        let addr = self.resolve(peer)?;
        let stream = tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!(peer, "connect timed out");
                ClientError::Timeout
            })?
            .map_err(|source| {
                warn!(peer, error = %source, "can't connect to peer");
                ClientError::Connect {
                    peer: peer.to_string(),
                    source,
                }
            })?;
        stream.set_nodelay(true)?;
        debug!(peer, %addr, "connected");
        Ok(stream)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::from_config(&PeerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default_port() {
        let connector = Connector::default();
        assert_eq!(
            connector.resolve("127.0.0.1").unwrap(),
            "127.0.0.1:4444".parse().unwrap()
        );
        assert_eq!(
            connector.resolve("::1").unwrap(),
            "[::1]:4444".parse().unwrap()
        );
    }

    #[test]
    fn test_resolve_explicit_port() {
        let connector = Connector::default();
        assert_eq!(
            connector.resolve("127.0.0.1:5000").unwrap(),
            "127.0.0.1:5000".parse().unwrap()
        );
        assert_eq!(connector.resolve("localhost:6000").unwrap().port(), 6000);
        assert_eq!(connector.resolve("localhost").unwrap().port(), 4444);
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = Connector::new(4444, Duration::from_millis(500));
        let err = connector.connect(&addr.to_string()).unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
