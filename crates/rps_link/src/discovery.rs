//! Peer discovery and token replay protection.
//!
//! Three ways for the peers to find each other, tried in the order the
//! deployment allows:
//!
//! 1. **Satellite listens**: the satellite binds a local-network socket and
//!    bakes its address into the OOB token; the host connects.
//! 2. **Host listens after flip**: the token carries only the satellite's
//!    key; the host binds a socket and announces its address with a one-line
//!    UDP datagram, then the satellite connects.
//! 3. **Bouncer**: the token carries a rendezvous address; both peers
//!    connect out to it.
//!
//! Whatever the mode, the result on each side is a connected `TcpStream`
//! handed to the transport for the handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use rps_proto::PairingToken;

use crate::error::LinkError;

// ── Token replay window ───────────────────────────────────────────────────────

/// Sliding window of consumed pairing nonces. A token is single-use: its
/// nonce is recorded on first sight and any reappearance inside the window
/// is a replay.
pub struct ReplayWindow {
    window: Duration,
    seen: HashMap<String, Instant>,
}

impl ReplayWindow {
    pub fn new(window: Duration) -> Self {
        Self { window, seen: HashMap::new() }
    }

    /// Default sliding window: 10 minutes.
    pub fn default_window() -> Self {
        Self::new(Duration::from_secs(600))
    }

    pub fn check_and_insert(&mut self, nonce: &str) -> Result<(), LinkError> {
        let now = Instant::now();
        self.seen.retain(|_, t| now.duration_since(*t) < self.window);
        if self.seen.contains_key(nonce) {
            return Err(LinkError::PairingReplay);
        }
        self.seen.insert(nonce.to_string(), now);
        Ok(())
    }
}

// ── Discovery modes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DiscoveryMode {
    /// Satellite opens a listening socket; its address goes into the token.
    SatelliteListens { bind: SocketAddr },
    /// Host listens; a UDP legwork line announces the host's address to the
    /// satellite, which then connects.
    HostListens { bind: SocketAddr, announce_to: SocketAddr },
    /// Both peers connect out to a rendezvous address from the token.
    Bouncer { rendezvous: SocketAddr },
}

/// One-line JSON datagram used by the host-listens flip.
#[derive(Debug, Serialize, Deserialize)]
struct AnnounceLine {
    #[serde(rename = "rpAnnounce")]
    addr: String,
}

/// Satellite-side endpoint prepared before the token is shown.
pub enum SatelliteEndpoint {
    Listener(TcpListener),
    AwaitFlip(UdpSocket),
    Bouncer(SocketAddr),
}

impl SatelliteEndpoint {
    /// Open the endpoint for a discovery mode and return the address to bake
    /// into the token (`None` for the flip mode, which advertises no
    /// address).
    pub async fn open(mode: &DiscoveryMode) -> Result<(Self, Option<String>), LinkError> {
        match mode {
            DiscoveryMode::SatelliteListens { bind } => {
                let listener = TcpListener::bind(bind).await?;
                let addr = listener.local_addr()?;
                info!(%addr, "satellite listening for host");
                Ok((SatelliteEndpoint::Listener(listener), Some(addr.to_string())))
            }
            DiscoveryMode::HostListens { bind, .. } => {
                let udp = UdpSocket::bind(bind).await?;
                info!(addr = %udp.local_addr()?, "satellite awaiting host announce");
                Ok((SatelliteEndpoint::AwaitFlip(udp), None))
            }
            DiscoveryMode::Bouncer { rendezvous } => {
                Ok((SatelliteEndpoint::Bouncer(*rendezvous), Some(rendezvous.to_string())))
            }
        }
    }

    /// Wait for the host and return the connected stream.
    pub async fn establish(self, deadline: Duration) -> Result<TcpStream, LinkError> {
        match self {
            SatelliteEndpoint::Listener(listener) => {
                let (stream, peer) = timeout(deadline, listener.accept())
                    .await
                    .map_err(|_| LinkError::Timeout)??;
                debug!(%peer, "host connected");
                Ok(stream)
            }
            SatelliteEndpoint::AwaitFlip(udp) => {
                let mut buf = [0u8; 256];
                let (n, from) = timeout(deadline, udp.recv_from(&mut buf))
                    .await
                    .map_err(|_| LinkError::Timeout)??;
                let line: AnnounceLine = serde_json::from_slice(&buf[..n])
                    .map_err(|e| LinkError::DecodeError(e.to_string()))?;
                debug!(%from, addr = %line.addr, "host announced itself");
                Ok(TcpStream::connect(&line.addr).await?)
            }
            SatelliteEndpoint::Bouncer(addr) => Ok(TcpStream::connect(addr).await?),
        }
    }
}

/// Host side: connect using the scanned token, or flip to listening when the
/// token advertises no address.
pub async fn host_establish(
    token: &PairingToken,
    flip: Option<&DiscoveryMode>,
    deadline: Duration,
) -> Result<TcpStream, LinkError> {
    if let Some(addr) = &token.addr {
        debug!(%addr, "connecting to satellite endpoint");
        return Ok(TcpStream::connect(addr.as_str()).await?);
    }

    // Token without an address: host-listens mode is the only option left.
    let Some(DiscoveryMode::HostListens { bind, announce_to }) = flip else {
        return Err(LinkError::HandshakeReject(
            "token has no address and no host-listens fallback configured".into(),
        ));
    };

    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    let udp = UdpSocket::bind("0.0.0.0:0").await?;
    let line = serde_json::to_vec(&AnnounceLine { addr: addr.to_string() })
        .map_err(|e| LinkError::DecodeError(e.to_string()))?;
    udp.send_to(&line, announce_to).await?;
    info!(%addr, %announce_to, "announced host endpoint, awaiting satellite");

    let (stream, peer) = timeout(deadline, listener.accept())
        .await
        .map_err(|_| LinkError::Timeout)??;
    debug!(%peer, "satellite connected");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_window_rejects_second_use() {
        let mut w = ReplayWindow::new(Duration::from_secs(600));
        w.check_and_insert("nonce-a").unwrap();
        assert!(matches!(
            w.check_and_insert("nonce-a"),
            Err(LinkError::PairingReplay)
        ));
        w.check_and_insert("nonce-b").unwrap();
    }

    #[tokio::test]
    async fn replay_window_forgets_after_expiry() {
        tokio::time::pause();
        let mut w = ReplayWindow::new(Duration::from_secs(600));
        w.check_and_insert("nonce").unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;
        w.check_and_insert("nonce").unwrap();
    }

    #[tokio::test]
    async fn satellite_listens_and_host_connects() {
        let mode = DiscoveryMode::SatelliteListens { bind: "127.0.0.1:0".parse().unwrap() };
        let (endpoint, addr) = SatelliteEndpoint::open(&mode).await.unwrap();
        let addr = addr.expect("listener mode advertises an address");

        let client = tokio::spawn(async move { TcpStream::connect(addr.as_str()).await });
        let stream = endpoint.establish(Duration::from_secs(5)).await.unwrap();
        client.await.unwrap().unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn bouncer_mode_connects_both_peers_outward() {
        // A dumb rendezvous: accept two connections.
        let bouncer = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rendezvous = bouncer.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (a, _) = bouncer.accept().await.unwrap();
            let (b, _) = bouncer.accept().await.unwrap();
            (a, b)
        });

        let mode = DiscoveryMode::Bouncer { rendezvous };
        let (endpoint, addr) = SatelliteEndpoint::open(&mode).await.unwrap();
        assert_eq!(addr.as_deref(), Some(rendezvous.to_string().as_str()));

        let sat_stream = endpoint.establish(Duration::from_secs(5)).await.unwrap();
        let token = {
            use rps_crypto::identity::BindingKeyPair;
            let kp = BindingKeyPair::generate();
            PairingToken::generate(&kp.public, "host", addr, chrono::Duration::minutes(10))
        };
        let host_stream = host_establish(&token, None, Duration::from_secs(5)).await.unwrap();
        accept.await.unwrap();
        drop((sat_stream, host_stream));
    }

    #[tokio::test]
    async fn flip_announce_roundtrip() {
        let mode = DiscoveryMode::HostListens {
            bind: "127.0.0.1:0".parse().unwrap(),
            announce_to: "127.0.0.1:0".parse().unwrap(),
        };
        // Satellite side opens the UDP socket first so the host knows where
        // to announce.
        let (endpoint, addr) = SatelliteEndpoint::open(&mode).await.unwrap();
        assert!(addr.is_none(), "flip mode must not advertise an address");
        let SatelliteEndpoint::AwaitFlip(udp) = &endpoint else { unreachable!() };
        let announce_to = udp.local_addr().unwrap();

        let host_mode = DiscoveryMode::HostListens {
            bind: "127.0.0.1:0".parse().unwrap(),
            announce_to,
        };
        let token = {
            use rps_crypto::identity::BindingKeyPair;
            let kp = BindingKeyPair::generate();
            PairingToken::generate(&kp.public, "host", None, chrono::Duration::minutes(10))
        };

        let host = tokio::spawn(async move {
            host_establish(&token, Some(&host_mode), Duration::from_secs(5)).await
        });
        let sat_stream = endpoint.establish(Duration::from_secs(5)).await.unwrap();
        let host_stream = host.await.unwrap().unwrap();
        drop((sat_stream, host_stream));
    }
}
