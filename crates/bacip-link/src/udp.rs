//! Non-blocking UDP endpoint with per-peer idle tracking.

use crate::LinkError;
use bacip_core::address::IpPort;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

const MAX_FRAME_LEN: usize = 1600;

/// Tracks the peers this endpoint has recently exchanged datagrams with.
///
/// Every send or receive refreshes the peer's deadline; [`sweep`] drops the
/// ones that have been quiet longer than the configured timeout. A timeout of
/// zero disables tracking entirely.
///
/// [`sweep`]: PeerRoster::sweep
#[derive(Debug, Default)]
pub struct PeerRoster {
    timeout: Duration,
    peers: HashMap<IpPort, Instant>,
}

impl PeerRoster {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            peers: HashMap::new(),
        }
    }

    pub fn touch(&mut self, peer: IpPort, now: Instant) {
        if self.timeout.is_zero() {
            return;
        }
        self.peers.insert(peer, now + self.timeout);
    }

    /// Remove idle peers, returning the evicted addresses.
    pub fn sweep(&mut self, now: Instant) -> Vec<IpPort> {
        let mut evicted = Vec::new();
        self.peers.retain(|peer, deadline| {
            if *deadline <= now {
                evicted.push(*peer);
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn contains(&self, peer: &IpPort) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// A bound BACnet/IP socket.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
    local: IpPort,
    roster: PeerRoster,
}

impl UdpEndpoint {
    /// Bind to the given address with broadcasting enabled. An idle timeout
    /// of zero disables peer tracking.
    pub async fn bind(bind_addr: SocketAddrV4, idle_timeout: Duration) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind(SocketAddr::V4(bind_addr)).await?;
        socket.set_broadcast(true)?;
        let local = match socket.local_addr()? {
            SocketAddr::V4(addr) => IpPort::from(addr),
            SocketAddr::V6(_) => unreachable!("bound to a v4 address"),
        };
        Ok(Self {
            socket,
            local,
            roster: PeerRoster::new(idle_timeout),
        })
    }

    pub fn local_addr(&self) -> IpPort {
        self.local
    }

    /// The all-ones broadcast endpoint on this socket's port.
    pub fn broadcast_addr(&self) -> IpPort {
        IpPort::new([255, 255, 255, 255], self.local.port)
    }

    pub async fn send(&mut self, dest: IpPort, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(LinkError::FrameTooLarge);
        }
        self.roster.touch(dest, Instant::now());
        let dest: SocketAddrV4 = dest.into();
        self.socket.send_to(frame, SocketAddr::V4(dest)).await?;
        Ok(())
    }

    /// Receive the next frame, skipping loopback copies of our own
    /// broadcasts and any IPv6 strays.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, IpPort), LinkError> {
        loop {
            let (n, src) = self.socket.recv_from(buf).await?;
            let src = match src {
                SocketAddr::V4(addr) => IpPort::from(addr),
                SocketAddr::V6(addr) => {
                    log::debug!("ignoring datagram from IPv6 source {addr}");
                    continue;
                }
            };
            if src == self.local {
                continue;
            }
            self.roster.touch(src, Instant::now());
            return Ok((n, src));
        }
    }

    /// Drop idle peers; called from the owner's housekeeping tick.
    pub fn sweep_peers(&mut self) -> Vec<IpPort> {
        let evicted = self.roster.sweep(Instant::now());
        for peer in &evicted {
            log::debug!("peer {peer} idle, dropping");
        }
        evicted
    }

    pub fn peer_roster(&self) -> &PeerRoster {
        &self.roster
    }
}

/// Convenience for binding an ephemeral loopback endpoint in tests.
#[doc(hidden)]
pub fn loopback() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

#[cfg(test)]
mod tests {
    use super::{loopback, PeerRoster, UdpEndpoint};
    use bacip_core::address::IpPort;
    use tokio::time::{Duration, Instant};

    #[test]
    fn roster_evicts_idle_peers() {
        let mut roster = PeerRoster::new(Duration::from_secs(10));
        let start = Instant::now();
        let a = IpPort::new([10, 0, 0, 1], 47808);
        let b = IpPort::new([10, 0, 0, 2], 47808);
        roster.touch(a, start);
        roster.touch(b, start + Duration::from_secs(5));

        assert!(roster.sweep(start + Duration::from_secs(9)).is_empty());
        assert_eq!(roster.sweep(start + Duration::from_secs(11)), vec![a]);
        assert!(roster.contains(&b));
    }

    #[test]
    fn zero_timeout_disables_tracking() {
        let mut roster = PeerRoster::new(Duration::ZERO);
        roster.touch(IpPort::new([10, 0, 0, 1], 47808), Instant::now());
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn endpoints_exchange_frames() {
        let mut a = UdpEndpoint::bind(loopback(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut b = UdpEndpoint::bind(loopback(), Duration::from_secs(60))
            .await
            .unwrap();

        a.send(b.local_addr(), &[0x81, 0x0A, 0x00, 0x04])
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, src) = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x81, 0x0A, 0x00, 0x04]);
        assert_eq!(src, a.local_addr());
        assert!(b.peer_roster().contains(&a.local_addr()));
    }
}
