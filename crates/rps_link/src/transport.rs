//! Secure duplex transport.
//!
//! A connection starts with two plaintext hello records (one per side), each
//! carrying a signed ephemeral. Everything after is ChaCha20-Poly1305 under
//! per-direction keys with counter nonces, length-prefixed like every other
//! record.
//!
//! One task per direction: the writer owns the sealing key and the outbound
//! queue and injects keepalive pings when idle; the reader owns the opening
//! key and turns silence longer than `keepalive × misses` into a broken
//! channel. Control frames never reach the inbound queue.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, warn};

use rps_crypto::{
    handshake::{derive_transport_keys, EphemeralKeys, Role, TransportKeys},
    identity::{BindingKeyPair, PublicKeyBytes},
    record::{OpeningKey, SealingKey},
};
use rps_proto::{
    codec::{self, LEN_PREFIX_SIZE},
    hello::{Hello, HelloRole},
    Frame,
};

use crate::{config::LinkConfig, error::LinkError};

const HOST_TO_SAT_AAD: &[u8] = b"rps-host-to-sat";
const SAT_TO_HOST_AAD: &[u8] = b"rps-sat-to-host";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Up,
    Broken,
    Closed,
}

// ── Record IO ─────────────────────────────────────────────────────────────────

pub(crate) async fn read_record<R: AsyncRead + Unpin>(
    rd: &mut R,
    max: usize,
) -> Result<Vec<u8>, LinkError> {
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    rd.read_exact(&mut prefix).await?;
    let len = codec::parse_len_prefix(prefix, max)?;
    let mut body = vec![0u8; len];
    rd.read_exact(&mut body).await?;
    Ok(body)
}

pub(crate) async fn write_record<W: AsyncWrite + Unpin>(
    wr: &mut W,
    body: &[u8],
    max: usize,
) -> Result<(), LinkError> {
    let framed = codec::frame_record(body, max)?;
    wr.write_all(&framed).await?;
    wr.flush().await?;
    Ok(())
}

// ── Handshake ─────────────────────────────────────────────────────────────────

pub struct HandshakeOutcome {
    pub keys: TransportKeys,
    pub peer_identity: PublicKeyBytes,
    pub nonce: Vec<u8>,
}

fn opposite(role: HelloRole) -> HelloRole {
    match role {
        HelloRole::Host => HelloRole::Satellite,
        HelloRole::Satellite => HelloRole::Host,
    }
}

fn check_pin(
    peer: &PublicKeyBytes,
    expected: Option<&PublicKeyBytes>,
) -> Result<(), LinkError> {
    match expected {
        Some(pin) if pin != peer => {
            warn!(
                offered = %peer.fingerprint(),
                pinned = %pin.fingerprint(),
                "peer key does not match pinned identity"
            );
            Err(LinkError::AuthFail)
        }
        _ => Ok(()),
    }
}

/// Connecting side: send our hello first, then verify the peer's.
pub async fn initiate_handshake(
    stream: &mut TcpStream,
    role: HelloRole,
    identity: &BindingKeyPair,
    nonce: &[u8],
    expected_peer: Option<&PublicKeyBytes>,
    cfg: &LinkConfig,
) -> Result<HandshakeOutcome, LinkError> {
    let max = codec::effective_max_record_size(cfg.max_record_size);
    let eph = EphemeralKeys::generate();
    let hello = Hello::build(role, identity, &eph, nonce);
    let body = serde_json::to_vec(&hello).map_err(|e| LinkError::DecodeError(e.to_string()))?;
    write_record(stream, &body, max).await?;

    let peer_body = timeout(cfg.handshake_timeout(), read_record(stream, max))
        .await
        .map_err(|_| LinkError::Timeout)??;
    let peer_hello: Hello = codec::decode_record(&peer_body)?;
    let (peer_identity, peer_eph) = peer_hello.verify(opposite(role))?;
    if peer_hello.nonce_bytes()? != nonce {
        return Err(LinkError::HandshakeReject("nonce mismatch".into()));
    }
    check_pin(&peer_identity, expected_peer)?;

    let keys = derive_transport_keys(role.into(), eph, &peer_eph, nonce)?;
    Ok(HandshakeOutcome { keys, peer_identity, nonce: nonce.to_vec() })
}

/// Accepting side, step 1: read the peer's hello so the caller can look up
/// the binding (registry pin, host keys) before answering.
pub async fn read_peer_hello(
    stream: &mut TcpStream,
    cfg: &LinkConfig,
) -> Result<Hello, LinkError> {
    let max = codec::effective_max_record_size(cfg.max_record_size);
    let body = timeout(cfg.handshake_timeout(), read_record(stream, max))
        .await
        .map_err(|_| LinkError::Timeout)??;
    Ok(codec::decode_record(&body)?)
}

/// Accepting side, step 2: verify the peer hello, answer with our own under
/// the peer's nonce, and derive keys.
pub async fn respond_handshake(
    stream: &mut TcpStream,
    role: HelloRole,
    identity: &BindingKeyPair,
    peer_hello: &Hello,
    expected_peer: Option<&PublicKeyBytes>,
    cfg: &LinkConfig,
) -> Result<HandshakeOutcome, LinkError> {
    let max = codec::effective_max_record_size(cfg.max_record_size);
    let (peer_identity, peer_eph) = peer_hello.verify(opposite(role))?;
    check_pin(&peer_identity, expected_peer)?;
    let nonce = peer_hello.nonce_bytes()?;

    let eph = EphemeralKeys::generate();
    let hello = Hello::build(role, identity, &eph, &nonce);
    let body = serde_json::to_vec(&hello).map_err(|e| LinkError::DecodeError(e.to_string()))?;
    write_record(stream, &body, max).await?;

    let keys = derive_transport_keys(role.into(), eph, &peer_eph, &nonce)?;
    Ok(HandshakeOutcome { keys, peer_identity, nonce })
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// Cloneable sender half of an established channel.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::Sender<Frame>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelSender {
    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if self.status() != ChannelStatus::Up {
            return Err(LinkError::ChannelBroken);
        }
        self.tx.send(frame).await.map_err(|_| LinkError::ChannelBroken)
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Polite close; the writer task exits after flushing the bye.
    pub async fn bye(&self, reason: &str) {
        let _ = self.tx.send(Frame::Bye { reason: reason.to_string() }).await;
    }
}

/// An established secure channel. The inbound queue carries only payload
/// frames (cmd/reply/event); control frames are handled inside the tasks.
pub struct Channel {
    pub sender: ChannelSender,
    pub inbound: mpsc::Receiver<Frame>,
    pub status: watch::Receiver<ChannelStatus>,
    pub peer_identity: PublicKeyBytes,
}

fn mark(status_tx: &watch::Sender<ChannelStatus>, s: ChannelStatus) {
    status_tx.send_if_modified(|cur| {
        if *cur == ChannelStatus::Up {
            *cur = s;
            true
        } else {
            false
        }
    });
}

/// Split the stream and spawn the read/write loops.
pub fn spawn_channel(
    stream: TcpStream,
    keys: TransportKeys,
    role: Role,
    peer_identity: PublicKeyBytes,
    cfg: &LinkConfig,
) -> Channel {
    let max = codec::effective_max_record_size(cfg.max_record_size);
    let keepalive = cfg.keepalive();
    let broken_after = cfg.broken_after();

    let (send_aad, recv_aad): (&'static [u8], &'static [u8]) = match role {
        Role::Host => (HOST_TO_SAT_AAD, SAT_TO_HOST_AAD),
        Role::Satellite => (SAT_TO_HOST_AAD, HOST_TO_SAT_AAD),
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(256);
    let (status_tx, status_rx) = watch::channel(ChannelStatus::Up);

    let (mut rd, mut wr) = stream.into_split();
    let mut seal = SealingKey::new(&keys.send);
    let mut open = OpeningKey::new(&keys.recv);

    // Writer: outbound frames plus keepalive pings when idle.
    let writer_status = status_tx.clone();
    tokio::spawn(async move {
        let mut last_write = Instant::now();
        loop {
            let frame = tokio::select! {
                maybe = out_rx.recv() => match maybe {
                    Some(frame) => frame,
                    None => break, // channel owner dropped
                },
                _ = sleep_until(last_write + keepalive) => Frame::Ping,
            };
            let closing = matches!(frame, Frame::Bye { .. });

            let written = async {
                let body = serde_json::to_vec(&frame)
                    .map_err(|e| LinkError::DecodeError(e.to_string()))?;
                let sealed = seal.seal(&body, send_aad)?;
                write_record(&mut wr, &sealed, max).await
            }
            .await;

            if let Err(e) = written {
                warn!(error = %e, "channel write failed");
                mark(&writer_status, ChannelStatus::Broken);
                break;
            }
            last_write = Instant::now();
            if closing {
                mark(&writer_status, ChannelStatus::Closed);
                break;
            }
        }
    });

    // Reader: decrypt, answer pings, surface payload frames.
    let pong_tx = out_tx.clone();
    let reader_status = status_tx;
    tokio::spawn(async move {
        loop {
            let body = match timeout(broken_after, read_record(&mut rd, max)).await {
                Err(_) => {
                    warn!("no frame within keepalive budget; channel broken");
                    mark(&reader_status, ChannelStatus::Broken);
                    break;
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "channel read ended");
                    mark(&reader_status, ChannelStatus::Broken);
                    break;
                }
                Ok(Ok(body)) => body,
            };

            let frame = match open
                .open(&body, recv_aad)
                .map_err(LinkError::from)
                .and_then(|pt| codec::decode_frame(&pt).map_err(LinkError::from))
            {
                Ok(frame) => frame,
                Err(e) => {
                    // Auth failures, replays, and garbage are all fatal for
                    // the channel; the session layer decides what comes next.
                    warn!(error = %e, kind = e.kind(), "fatal record error");
                    mark(&reader_status, ChannelStatus::Broken);
                    break;
                }
            };

            match frame {
                Frame::Ping => {
                    let _ = pong_tx.send(Frame::Pong).await;
                }
                Frame::Pong => {}
                Frame::Bye { reason } => {
                    debug!(reason, "peer closed channel");
                    mark(&reader_status, ChannelStatus::Closed);
                    break;
                }
                payload => {
                    if in_tx.send(payload).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Channel {
        sender: ChannelSender { tx: out_tx, status: status_rx.clone() },
        inbound: in_rx,
        status: status_rx,
        peer_identity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    async fn pair(cfg: &LinkConfig) -> (Channel, Channel) {
        let host_id = BindingKeyPair::generate();
        let sat_id = BindingKeyPair::generate();
        let nonce = b"handshake-test".to_vec();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let cfg_sat = cfg.clone();
        let sat = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_peer_hello(&mut stream, &cfg_sat).await.unwrap();
            let out = respond_handshake(
                &mut stream,
                HelloRole::Satellite,
                &sat_id,
                &hello,
                None,
                &cfg_sat,
            )
            .await
            .unwrap();
            spawn_channel(stream, out.keys, Role::Satellite, out.peer_identity, &cfg_sat)
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let out = initiate_handshake(&mut stream, HelloRole::Host, &host_id, &nonce, None, cfg)
            .await
            .unwrap();
        let host_chan = spawn_channel(stream, out.keys, Role::Host, out.peer_identity, cfg);
        (host_chan, sat.await.unwrap())
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let cfg = LinkConfig::default();
        let (host, mut sat) = pair(&cfg).await;
        let mut host = host;

        host.sender
            .send(Frame::Event { resp: json!({"type": "newChatItem"}) })
            .await
            .unwrap();
        assert_eq!(
            sat.inbound.recv().await.unwrap(),
            Frame::Event { resp: json!({"type": "newChatItem"}) }
        );

        sat.sender
            .send(Frame::Cmd { id: 1, cmd: json!({"type": "apiSendMessage"}) })
            .await
            .unwrap();
        let got = host.inbound.recv().await.unwrap();
        assert_eq!(got.corr_id(), Some(1));
    }

    #[tokio::test]
    async fn bye_closes_cleanly() {
        let cfg = LinkConfig::default();
        let (host, mut sat) = pair(&cfg).await;

        host.sender.bye("takeover").await;
        // The satellite reader sees the bye and flips to Closed without
        // delivering it as a payload frame.
        let mut status = sat.status.clone();
        status
            .wait_for(|s| *s == ChannelStatus::Closed)
            .await
            .unwrap();
        assert!(sat.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_peer_breaks_channel() {
        let cfg = LinkConfig::default();
        let (host, sat) = pair(&cfg).await;
        drop(sat);

        let mut status = host.status.clone();
        status
            .wait_for(|s| *s != ChannelStatus::Up)
            .await
            .unwrap();
        assert!(host.sender.send(Frame::Ping).await.is_err());
    }

    #[tokio::test]
    async fn keepalive_pings_keep_an_idle_channel_up() {
        let mut cfg = LinkConfig::default();
        cfg.keepalive_secs = 1;
        cfg.keepalive_misses = 2;
        let (host, mut sat) = pair(&cfg).await;

        // Stay idle past several keepalive intervals; pings must keep both
        // readers satisfied.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(host.sender.status(), ChannelStatus::Up);

        host.sender
            .send(Frame::Event { resp: json!({"still": "alive"}) })
            .await
            .unwrap();
        assert!(sat.inbound.recv().await.is_some());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_at_send() {
        let cfg = LinkConfig::default();
        let (host, _sat) = pair(&cfg).await;

        let big = "x".repeat(codec::effective_max_record_size(cfg.max_record_size));
        host.sender
            .send(Frame::Event { resp: json!({"blob": big}) })
            .await
            .unwrap();
        // The writer hits FrameTooLarge when sealing and breaks the channel.
        let mut status = host.status.clone();
        status
            .wait_for(|s| *s == ChannelStatus::Broken)
            .await
            .unwrap();
    }
}
