//! Controller integration — satellite side.
//!
//! The satellite generates the OOB token, waits for the host to connect,
//! and then drives the host's chat engine through the channel. Local UI
//! commands get a correlation id and a pending waiter; while the channel is
//! down they queue in a bounded FIFO and flush in insertion order on
//! reconnect. A broken channel triggers the exponential-backoff reconnect
//! loop while the session stays suspended; past the ceiling the session is
//! disposed and every queued command fails.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use rand::RngCore;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use rps_crypto::{
    handshake::Role,
    identity::{BindingKeyPair, PublicKeyBytes},
};
use rps_proto::{
    hello::HelloRole,
    pairing::{IdentityStatus, PairingMsg, SatEvent},
    Frame, PairingToken,
};

use crate::{
    config::LinkConfig,
    discovery::{DiscoveryMode, SatelliteEndpoint},
    error::LinkError,
    policy,
    router::{self, SatelliteRouter},
    session::{SessionPhase, SessionState},
    transport::{self, Channel, ChannelStatus},
};

struct QueuedCommand {
    cmd: Value,
    waiter: oneshot::Sender<Result<Value, LinkError>>,
}

struct SatInner {
    session: Option<Arc<Mutex<SessionState>>>,
    sender: Option<transport::ChannelSender>,
    queue: VecDeque<QueuedCommand>,
    next_corr: u64,
    /// Host binding key pinned after the first handshake.
    host_identity: Option<PublicKeyBytes>,
    sat_identity_id: Option<i64>,
    identity_status: Option<IdentityStatus>,
    /// Where the host accepts reconnects; provided by the embedding client.
    reconnect_addr: Option<SocketAddr>,
}

#[derive(Clone)]
pub struct SatelliteController {
    cfg: Arc<LinkConfig>,
    identity: Arc<BindingKeyPair>,
    /// Decoded host events for the local UI, as if from a local engine.
    ui_events: mpsc::Sender<Value>,
    /// Session lifecycle notifications for the local UI.
    lifecycle: mpsc::Sender<SatEvent>,
    inner: Arc<Mutex<SatInner>>,
}

/// Prepared endpoint returned by `begin_pairing`, consumed once the token
/// has been shown to the user.
pub struct PairingPrep {
    endpoint: SatelliteEndpoint,
    token: PairingToken,
}

impl SatelliteController {
    pub fn new(
        cfg: LinkConfig,
        identity: BindingKeyPair,
        ui_events: mpsc::Sender<Value>,
        lifecycle: mpsc::Sender<SatEvent>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            identity: Arc::new(identity),
            ui_events,
            lifecycle,
            inner: Arc::new(Mutex::new(SatInner {
                session: None,
                sender: None,
                queue: VecDeque::new(),
                next_corr: 1,
                host_identity: None,
                sat_identity_id: None,
                identity_status: None,
                reconnect_addr: None,
            })),
        }
    }

    async fn emit(&self, ev: SatEvent) {
        let _ = self.lifecycle.send(ev).await;
    }

    pub async fn sat_identity_id(&self) -> Option<i64> {
        self.inner.lock().await.sat_identity_id
    }

    pub async fn identity_status(&self) -> Option<IdentityStatus> {
        self.inner.lock().await.identity_status
    }

    async fn set_status(&self, status: IdentityStatus) {
        self.inner.lock().await.identity_status = Some(status);
    }

    pub async fn phase(&self) -> Option<SessionPhase> {
        let state = self.inner.lock().await.session.clone()?;
        let phase = state.lock().await.phase();
        Some(phase)
    }

    pub async fn set_reconnect_addr(&self, addr: SocketAddr) {
        self.inner.lock().await.reconnect_addr = Some(addr);
    }

    // ── Pairing ─────────────────────────────────────────────────────────────

    /// Open the discovery endpoint and mint the single-use OOB token. The
    /// returned string is what the user shows to the host (typically a QR).
    pub async fn begin_pairing(
        &self,
        mode: &DiscoveryMode,
        host_hint: &str,
    ) -> Result<(String, PairingPrep), LinkError> {
        let (endpoint, addr) = SatelliteEndpoint::open(mode).await?;
        let token = PairingToken::generate(
            &self.identity.public,
            host_hint,
            addr,
            self.cfg.pairing_deadline(),
        );
        info!(host_hint, "pairing token generated");
        Ok((token.encode(), PairingPrep { endpoint, token }))
    }

    /// Wait for the host, run the handshake, and request an identity.
    /// Returns the satellite identity id once the host records it; the
    /// confirm/reject decision arrives later on the lifecycle queue.
    pub async fn complete_pairing(&self, prep: PairingPrep) -> Result<i64, LinkError> {
        let deadline = Duration::from_secs(self.cfg.pairing_deadline_secs);
        let mut stream = prep.endpoint.establish(deadline).await?;

        let hello = transport::read_peer_hello(&mut stream, &self.cfg).await?;
        if hello.nonce_bytes().map_err(LinkError::from)? != prep.token.nonce_bytes()? {
            return Err(LinkError::HandshakeReject(
                "host did not echo the token nonce".into(),
            ));
        }
        let out = transport::respond_handshake(
            &mut stream,
            HelloRole::Satellite,
            &self.identity,
            &hello,
            None, // first contact: the confirm step pins the host key
            &self.cfg,
        )
        .await?;

        let channel = transport::spawn_channel(
            stream,
            out.keys,
            Role::Satellite,
            out.peer_identity.clone(),
            &self.cfg,
        );

        let state = Arc::new(Mutex::new(SessionState::new(0, self.cfg.event_buffer_capacity)));
        {
            let mut inner = self.inner.lock().await;
            inner.session = Some(state.clone());
            inner.sender = Some(channel.sender.clone());
            inner.host_identity = Some(out.peer_identity);
        }
        self.install_loops(channel).await;

        state.lock().await.transition(SessionPhase::Pairing)?;
        self.set_status(IdentityStatus::Requested).await;
        let request = serde_json::to_value(PairingMsg::SatRequestIdentity {
            identity: prep.token.encode(),
        })
        .expect("pairing message serializes");
        let resp = self.send_command(request).await?;

        if let Some(err) = error_from_reply(&resp) {
            return Err(err);
        }
        let record: PairingMsg = serde_json::from_value(resp)
            .map_err(|e| LinkError::DecodeError(e.to_string()))?;
        let PairingMsg::SatIdentityRecord { sat_identity_id, .. } = record else {
            return Err(LinkError::HandshakeReject("unexpected pairing reply".into()));
        };

        {
            let mut inner = self.inner.lock().await;
            inner.sat_identity_id = Some(sat_identity_id);
            inner.identity_status = Some(IdentityStatus::Recorded);
        }
        state.lock().await.sat_identity_id = sat_identity_id;
        info!(sat_identity_id, "identity recorded by host; awaiting approval");
        Ok(sat_identity_id)
    }

    // Boxed rather than `async fn` so the recursive call chain
    // (install_loops -> channel_watcher -> reconnect_loop -> try_reconnect
    // -> install_loops) doesn't force rustc into a cyclic auto-trait (Send)
    // computation over the opaque future type.
    fn install_loops(&self, channel: Channel) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let state = {
                let inner = self.inner.lock().await;
                inner.session.clone().expect("session installed before channel")
            };
            let (pairing_tx, pairing_rx) = mpsc::channel(8);
            let sr = SatelliteRouter {
                session: state,
                ui_events: self.ui_events.clone(),
                pairing_tx,
            };
            tokio::spawn(router::satellite_channel_loop(sr, channel.inbound));
            tokio::spawn(self.clone().pairing_event_loop(pairing_rx));
            tokio::spawn(self.clone().channel_watcher(channel.status));
        })
    }

    async fn pairing_event_loop(self, mut rx: mpsc::Receiver<PairingMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                PairingMsg::SatIdentityConfirm { sat_identity_id } => {
                    let Some(state) = self.inner.lock().await.session.clone() else { continue };
                    if let Err(e) = state.lock().await.transition(SessionPhase::Active) {
                        warn!(error = %e, "confirm in unexpected phase");
                        continue;
                    }
                    self.set_status(IdentityStatus::Confirmed).await;
                    self.emit(SatEvent::SatIdentityConfirmed { sat_identity_id }).await;
                    self.flush_queue().await;
                }
                PairingMsg::SatIdentityReject { sat_identity_id } => {
                    info!(sat_identity_id, "host rejected pairing");
                    self.set_status(IdentityStatus::Rejected).await;
                    self.emit(SatEvent::SatIdentityRejected { sat_identity_id }).await;
                    self.dispose_local(false).await;
                }
                PairingMsg::SatTakeover => {
                    let sat_identity_id =
                        self.inner.lock().await.sat_identity_id.unwrap_or_default();
                    let Some(state) = self.inner.lock().await.session.clone() else { continue };
                    let _ = state.lock().await.transition(SessionPhase::Suspended);
                    self.set_status(IdentityStatus::TookOver).await;
                    self.emit(SatEvent::SatTookOver { sat_identity_id }).await;
                }
                PairingMsg::SatResumed { .. } => {
                    let Some(state) = self.inner.lock().await.session.clone() else { continue };
                    let _ = state.lock().await.transition(SessionPhase::Active);
                    self.set_status(IdentityStatus::Confirmed).await;
                    self.flush_queue().await;
                }
                PairingMsg::SatIdentityDeregister { sat_identity_id } => {
                    info!(sat_identity_id, "host deregistered this device");
                    self.dispose_local(true).await;
                }
                other => {
                    warn!(?other, "unexpected pairing message from host");
                }
            }
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Run one chat command on the host. Resolves with the host's reply,
    /// a `Timeout`, or `SessionDisposed` — exactly one of them.
    pub async fn send_command(&self, cmd: Value) -> Result<Value, LinkError> {
        let tag = policy::command_tag(&cmd).unwrap_or_default().to_string();
        let rx = self.enqueue_or_send(cmd, &tag).await?;
        rx.await.map_err(|_| LinkError::SessionDisposed)?
    }

    async fn enqueue_or_send(
        &self,
        cmd: Value,
        tag: &str,
    ) -> Result<oneshot::Receiver<Result<Value, LinkError>>, LinkError> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.session.clone() else {
            return Err(LinkError::SessionDisposed);
        };
        let phase = state.lock().await.phase();

        match phase {
            SessionPhase::Active | SessionPhase::Pairing => {
                let corr = inner.next_corr;
                inner.next_corr += 1;
                let sender = inner.sender.clone().ok_or(LinkError::ChannelBroken)?;
                drop(inner);

                let (tx, rx) = oneshot::channel();
                state.lock().await.register_pending(corr, tx);
                if let Err(e) = sender.send(Frame::Cmd { id: corr, cmd }).await {
                    state.lock().await.take_pending(corr);
                    return Err(e);
                }
                self.spawn_timeout(state, corr, self.cfg.command_timeout(tag));
                Ok(rx)
            }
            SessionPhase::Suspended => {
                if inner.queue.len() >= self.cfg.command_queue_capacity {
                    warn!(tag, "command queue full while suspended");
                    return Err(LinkError::SessionSuspended);
                }
                let (tx, rx) = oneshot::channel();
                inner.queue.push_back(QueuedCommand { cmd, waiter: tx });
                debug!(tag, queued = inner.queue.len(), "command queued while suspended");
                Ok(rx)
            }
            SessionPhase::Disposed => Err(LinkError::SessionDisposed),
            SessionPhase::Idle => Err(LinkError::SessionSuspended),
        }
    }

    fn spawn_timeout(&self, state: Arc<Mutex<SessionState>>, corr: u64, after: Duration) {
        tokio::spawn(async move {
            sleep(after).await;
            if let Some(waiter) = state.lock().await.take_pending(corr) {
                debug!(corr_id = corr, "command timed out");
                let _ = waiter.send(Err(LinkError::Timeout));
            }
        });
    }

    /// Flush queued commands in insertion order onto a live channel.
    async fn flush_queue(&self) {
        loop {
            let (cmd, waiter, corr, sender, state) = {
                let mut inner = self.inner.lock().await;
                let Some(next) = inner.queue.pop_front() else { break };
                let Some(sender) = inner.sender.clone() else {
                    inner.queue.push_front(next);
                    break;
                };
                let Some(state) = inner.session.clone() else { break };
                let corr = inner.next_corr;
                inner.next_corr += 1;
                (next.cmd, next.waiter, corr, sender, state)
            };
            let tag = policy::command_tag(&cmd).unwrap_or_default().to_string();
            state.lock().await.register_pending(corr, waiter);
            if let Err(e) = sender.send(Frame::Cmd { id: corr, cmd }).await {
                debug!(error = %e, "channel died mid-flush; command left pending");
            }
            self.spawn_timeout(state, corr, self.cfg.command_timeout(&tag));
        }
    }

    // ── Reconnect ───────────────────────────────────────────────────────────

    async fn channel_watcher(self, mut status: watch::Receiver<ChannelStatus>) {
        let outcome = match status.wait_for(|s| *s != ChannelStatus::Up).await {
            Ok(s) => *s,
            Err(_) => ChannelStatus::Broken,
        };
        match outcome {
            // A bye from the host is deliberate: disposed, rejected, or
            // deregistered. The pairing loop may already have cleaned up.
            ChannelStatus::Closed => self.dispose_local(true).await,
            ChannelStatus::Broken | ChannelStatus::Up => self.reconnect_loop().await,
        }
    }

    async fn reconnect_loop(self) {
        let state = {
            let mut inner = self.inner.lock().await;
            inner.sender = None;
            inner.session.clone()
        };
        let Some(state) = state else { return };
        {
            let mut st = state.lock().await;
            match st.phase() {
                SessionPhase::Active => {
                    warn!("channel broken; suspending and retrying");
                    let _ = st.transition(SessionPhase::Suspended);
                }
                SessionPhase::Suspended => {}
                _ => {
                    drop(st);
                    self.dispose_local(true).await;
                    return;
                }
            }
        }

        let start = Instant::now();
        let mut delay = self.cfg.backoff_initial();
        loop {
            if start.elapsed() >= self.cfg.reconnect_ceiling() {
                warn!("reconnect ceiling reached; disposing session");
                self.dispose_local(true).await;
                return;
            }
            sleep(delay).await;
            delay = (delay * 2).min(self.cfg.backoff_cap());

            let addr = self.inner.lock().await.reconnect_addr;
            let Some(addr) = addr else { continue };

            // The session may have been disposed or replaced while we slept.
            if self.inner.lock().await.session.is_none() {
                return;
            }

            match self.try_reconnect(addr).await {
                Ok(()) => {
                    info!(%addr, "reconnected to host");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, kind = e.kind(), next_delay = ?delay, "reconnect attempt failed");
                }
            }
        }
    }

    async fn try_reconnect(&self, addr: SocketAddr) -> Result<(), LinkError> {
        let mut stream = TcpStream::connect(addr).await?;
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let pin = self.inner.lock().await.host_identity.clone();
        let out = transport::initiate_handshake(
            &mut stream,
            HelloRole::Satellite,
            &self.identity,
            &nonce,
            pin.as_ref(),
            &self.cfg,
        )
        .await?;
        let channel = transport::spawn_channel(
            stream,
            out.keys,
            Role::Satellite,
            out.peer_identity,
            &self.cfg,
        );

        let state = {
            let mut inner = self.inner.lock().await;
            inner.sender = Some(channel.sender.clone());
            inner.session.clone().ok_or(LinkError::SessionDisposed)?
        };
        self.install_loops(channel).await;
        state.lock().await.transition(SessionPhase::Active)?;
        state.lock().await.touch();
        self.flush_queue().await;
        Ok(())
    }

    // ── Disposal ────────────────────────────────────────────────────────────

    /// Satellite-initiated dispose. Tells the host, then tears down locally.
    /// The device row on the host stays `active`.
    pub async fn terminate(&self) -> Result<(), LinkError> {
        let live = {
            let inner = self.inner.lock().await;
            inner.session.is_some() && inner.sender.is_some()
        };
        if live {
            let msg = serde_json::to_value(PairingMsg::SatTerminateIdentity)
                .expect("pairing message serializes");
            // Best effort: the dispose proceeds whether or not the host
            // answers in time.
            let _ = timeout(Duration::from_secs(5), self.send_command(msg)).await;
        }
        self.dispose_local(true).await;
        Ok(())
    }

    async fn dispose_local(&self, notify: bool) {
        let (state, sender, sat_id, queue) = {
            let mut inner = self.inner.lock().await;
            (
                inner.session.take(),
                inner.sender.take(),
                inner.sat_identity_id.take(),
                std::mem::take(&mut inner.queue),
            )
        };
        let Some(state) = state else { return }; // already gone: no-op
        self.inner.lock().await.identity_status = Some(IdentityStatus::Disposed);
        if let Some(sender) = sender {
            sender.bye("terminated").await;
        }
        let _ = state.lock().await.dispose();
        for q in queue {
            let _ = q.waiter.send(Err(LinkError::SessionDisposed));
        }
        if notify {
            self.emit(SatEvent::SatIdentityDisposed {
                sat_identity_id: sat_id.unwrap_or_default(),
            })
            .await;
        }
        info!("satellite session disposed");
    }
}

/// Map an error reply (`chatErrorSatellite`) back to a typed error.
fn error_from_reply(resp: &Value) -> Option<LinkError> {
    if resp.get("type")?.as_str()? != "chatErrorSatellite" {
        return None;
    }
    let message = resp
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(match resp.get("kind").and_then(Value::as_str) {
        Some("pairingExpired") => LinkError::PairingExpired,
        Some("pairingReplay") => LinkError::PairingReplay,
        Some("deniedCommand") => LinkError::DeniedCommand { tag: message },
        Some("sessionSuspended") => LinkError::SessionSuspended,
        Some("sessionDisposed") => LinkError::SessionDisposed,
        Some("deviceRevoked") => LinkError::DeviceRevoked,
        Some("deviceUnknown") => LinkError::DeviceUnknown,
        _ => LinkError::HandshakeReject(message),
    })
}
