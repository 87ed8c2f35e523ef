use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

#[cfg_attr(test, mockall::automock)]
pub trait NtpTransport {
    /// Resolve a pool hostname to one server address.
    fn resolve(&mut self, host: &str) -> Result<SocketAddr>;

    /// Send one datagram to `addr`, which also becomes the only peer
    /// `recv` accepts replies from.
    fn send(&mut self, addr: SocketAddr, packet: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for a reply. Returns Ok(None) on timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}
