//! Interface and socket helpers: local address, directed broadcast, TCP keepalive.

use std::net::Ipv4Addr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// First non-loopback IPv4 address, or 127.0.0.1 when there is none.
pub fn local_ipv4() -> Ipv4Addr {
    let addrs = match if_addrs::get_if_addrs() {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(error = %e, "cannot list interfaces, using loopback");
            return Ipv4Addr::LOCALHOST;
        }
    };
    addrs
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match &iface.addr {
            if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// `ip | !netmask`.
pub fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Subnet-directed broadcast for the interface owning `ip`; 255.255.255.255 if not found.
pub fn broadcast_addr(ip: Ipv4Addr) -> Ipv4Addr {
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return Ipv4Addr::BROADCAST;
    };
    addrs
        .iter()
        .find_map(|iface| match &iface.addr {
            if_addrs::IfAddr::V4(v4) if v4.ip == ip => Some(directed_broadcast(ip, v4.netmask)),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::BROADCAST)
}

/// OS-level keepalive so half-open links are noticed without app heartbeats.
pub fn set_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(period)
        .with_interval(Duration::from_secs(5));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directed_broadcast_from_mask() {
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            directed_broadcast(Ipv4Addr::new(10, 20, 30, 40), Ipv4Addr::new(255, 255, 240, 0)),
            Ipv4Addr::new(10, 20, 31, 255)
        );
    }

    #[test]
    fn unknown_ip_falls_back_to_limited_broadcast() {
        assert_eq!(broadcast_addr(Ipv4Addr::new(203, 0, 113, 77)), Ipv4Addr::BROADCAST);
    }

    #[tokio::test]
    async fn keepalive_on_loopback_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _server) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        set_keepalive(&client, Duration::from_secs(15)).unwrap();
        assert!(SockRef::from(&client).keepalive().unwrap());
    }
}
