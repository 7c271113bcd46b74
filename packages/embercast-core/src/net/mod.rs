//! Socket-level helpers shared by the listen container, the connection
//! pool and the relay engine, plus the GeoIP annotation contract.

pub mod connection;
pub mod listen;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

/// Location annotations attached to a connection when a lookup provider
/// is wired in.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoAnnotation {
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// IP-to-location lookup; the database backend stays external.
pub trait GeoIp: Send + Sync {
    /// Annotations for a textual peer IP; `None` when unknown.
    fn lookup(&self, ip: &str) -> Option<GeoAnnotation>;
}

/// Renders a peer address as text, unmapping IPv4-in-IPv6 so logs and
/// match lists see the plain IPv4 form.
#[must_use]
pub fn peer_ip_text(addr: SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                v4.to_string()
            } else {
                v6.to_string()
            }
        }
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// TCP connect bounded by a deadline.
pub async fn connect_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_ipv6_is_unwrapped() {
        let addr: SocketAddr = "[::ffff:10.1.2.3]:80".parse().unwrap();
        assert_eq!(peer_ip_text(addr), "10.1.2.3");
    }

    #[test]
    fn plain_addresses_pass_through() {
        let v4: SocketAddr = "192.168.0.1:8000".parse().unwrap();
        assert_eq!(peer_ip_text(v4), "192.168.0.1");
        let v6: SocketAddr = "[2001:db8::1]:8000".parse().unwrap();
        assert_eq!(peer_ip_text(v6), "2001:db8::1");
    }

    #[tokio::test]
    async fn connect_timeout_connects_locally() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_timeout(&addr.to_string(), Duration::from_secs(1)).await;
        assert!(stream.is_ok());
    }
}
