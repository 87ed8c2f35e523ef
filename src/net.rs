use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::ntp::{NTP_PACKET_SIZE, NTP_PORT};
use crate::traits::NtpTransport;

/// UDP socket for the NTP server. Reads time out so the loop can notice
/// shutdown.
pub fn create_server_socket(bind: IpAddr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(bind, port);
    let domain = if bind.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into()).map_err(|e| {
        anyhow!(
            "Failed to bind NTP server to {}: {} (hint: port 123 requires root or CAP_NET_BIND_SERVICE)",
            addr,
            e
        )
    })?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;

    Ok(socket.into())
}

/// Log the addresses LAN clients can reach the server on.
pub fn log_interfaces(port: u16) {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            for iface in ifaces.iter().filter(|i| !i.is_loopback()) {
                info!("[Net] Serving on {} ({}:{})", iface.name, iface.ip(), port);
            }
        }
        Err(e) => debug!("[Net] Could not list interfaces: {}", e),
    }
}

/// Run a blocking name lookup on a helper thread and give up after
/// `timeout`. A lookup that outlives the timeout finishes on its own thread
/// and its result is dropped.
pub fn resolve_with_timeout<F>(host: &str, timeout: Duration, lookup: F) -> Result<SocketAddr>
where
    F: FnOnce(String) -> std::io::Result<Vec<SocketAddr>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let name = host.to_string();
    thread::Builder::new()
        .name("ntp-resolve".into())
        .spawn(move || {
            let _ = tx.send(lookup(name));
        })
        .context("Failed to start resolver thread")?;

    let addrs = match rx.recv_timeout(timeout) {
        Ok(result) => result.with_context(|| format!("Failed to resolve {}", host))?,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            return Err(anyhow!("Resolving {} timed out after {:?}", host, timeout));
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(anyhow!("Resolver for {} exited without an answer", host));
        }
    };
    addrs
        .into_iter()
        .find(|a| a.is_ipv4())
        .ok_or_else(|| anyhow!("No IPv4 address for {}", host))
}

/// Client transport over one unconnected-then-connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    resolve_timeout: Duration,
}

impl UdpTransport {
    /// Name lookups give up after `resolve_timeout`.
    pub fn new(resolve_timeout: Duration) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to allocate NTP client socket")?;
        Ok(UdpTransport {
            socket,
            resolve_timeout,
        })
    }
}

impl NtpTransport for UdpTransport {
    fn resolve(&mut self, host: &str) -> Result<SocketAddr> {
        resolve_with_timeout(host, self.resolve_timeout, |name| {
            (name.as_str(), NTP_PORT).to_socket_addrs().map(|addrs| addrs.collect())
        })
    }

    fn send(&mut self, addr: SocketAddr, packet: &[u8]) -> Result<()> {
        self.socket.connect(addr)?;
        // Drop anything a previous peer sent late.
        self.socket.set_nonblocking(true)?;
        let mut scratch = [0u8; NTP_PACKET_SIZE];
        while self.socket.recv(&mut scratch).is_ok() {}
        self.socket.set_nonblocking(false)?;

        self.socket.send(packet)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; 512];
        match self.socket.recv(&mut buf) {
            Ok(size) => Ok(Some(buf[..size].to_vec())),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_socket_binds_ephemeral() {
        let socket = create_server_socket(IpAddr::from([127, 0, 0, 1]), 0).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_transport_exchange_and_timeout() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut transport = UdpTransport::new(Duration::from_secs(1)).unwrap();
        transport.send(peer_addr, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        peer.send_to(&[9; 48], from).unwrap();

        let reply = transport.recv(Duration::from_secs(1)).unwrap();
        assert_eq!(reply, Some(vec![9; 48]));

        let nothing = transport.recv(Duration::from_millis(20)).unwrap();
        assert_eq!(nothing, None);
    }

    #[test]
    fn test_resolve_literal_address() {
        let mut transport = UdpTransport::new(Duration::from_secs(1)).unwrap();
        let addr = transport.resolve("127.0.0.1").unwrap();
        assert_eq!(addr, "127.0.0.1:123".parse().unwrap());
    }

    #[test]
    fn test_stalled_lookup_times_out() {
        let started = std::time::Instant::now();
        let result = resolve_with_timeout("stalled.pool.example", Duration::from_millis(50), |_| {
            thread::sleep(Duration::from_secs(5));
            Ok(vec!["192.0.2.1:123".parse().unwrap()])
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_lookup_prefers_ipv4_and_reports_failure() {
        let addr = resolve_with_timeout("dual.example", Duration::from_secs(1), |_| {
            Ok(vec!["[2001:db8::1]:123".parse().unwrap(), "192.0.2.7:123".parse().unwrap()])
        })
        .unwrap();
        assert_eq!(addr, "192.0.2.7:123".parse().unwrap());

        let err = resolve_with_timeout("v6only.example", Duration::from_secs(1), |_| {
            Ok(vec!["[2001:db8::1]:123".parse().unwrap()])
        })
        .unwrap_err();
        assert!(err.to_string().contains("No IPv4"), "{}", err);

        let err = resolve_with_timeout("missing.example", Duration::from_secs(1), |_| {
            Err(std::io::Error::new(ErrorKind::NotFound, "no such host"))
        })
        .unwrap_err();
        assert!(err.to_string().contains("Failed to resolve missing.example"), "{}", err);
    }
}
