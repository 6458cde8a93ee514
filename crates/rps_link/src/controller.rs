//! Controller integration — host side.
//!
//! One process-wide controller glues the registry, the session state
//! machine, and the transport to the existing chat controller. It holds
//! exactly one optional satellite-id slot and one optional session slot; all
//! transitions run under the same lock, which the embedding client shares
//! with its chat-store writer so registry updates and state transitions are
//! atomic with respect to chat activity.
//!
//! Lifecycle responses (`SatRequestIdentity`, `SatIdentityRecord`, …) are
//! emitted on the chat output queue so the host UI can present approvals and
//! takeovers as notifications.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use rps_crypto::{handshake::Role, identity::PublicKeyBytes};
use rps_proto::{
    hello::HelloRole,
    pairing::{PairingMsg, SatEvent},
    Frame, PairingToken,
};
use rps_store::{models::DeviceStatus, Registry, StoreError};

use crate::{
    config::LinkConfig,
    discovery::{self, DiscoveryMode, ReplayWindow},
    engine::{EngineHandle, EngineOutput},
    error::LinkError,
    router::{self, HostRouter},
    session::{SessionPhase, SessionState},
    transport::{self, Channel, ChannelSender, ChannelStatus},
};

struct HostInner {
    /// The active satellite, if any. One at a time.
    satellite_id: Option<i64>,
    session: Option<Arc<Mutex<SessionState>>>,
    sender: Option<ChannelSender>,
    device_id: Option<i64>,
    /// Nonce of the token accepted by the host UI; the satellite's
    /// `satRequestIdentity` must present the same token.
    token_nonce: Option<String>,
    replay: ReplayWindow,
    next_sat_identity: i64,
    /// Channel incarnation counter; keeps stale watchers from acting on a
    /// session that has since reconnected.
    epoch: u64,
}

#[derive(Clone)]
pub struct HostController {
    cfg: Arc<LinkConfig>,
    registry: Registry,
    engine: EngineHandle,
    ui_events: mpsc::Sender<SatEvent>,
    mirror: mpsc::Sender<Value>,
    inner: Arc<Mutex<HostInner>>,
}

impl HostController {
    pub fn new(
        cfg: LinkConfig,
        registry: Registry,
        engine: EngineHandle,
        ui_events: mpsc::Sender<SatEvent>,
        mirror: mpsc::Sender<Value>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            registry,
            engine,
            ui_events,
            mirror,
            inner: Arc::new(Mutex::new(HostInner {
                satellite_id: None,
                session: None,
                sender: None,
                device_id: None,
                token_nonce: None,
                replay: ReplayWindow::default_window(),
                next_sat_identity: 1,
                epoch: 0,
            })),
        }
    }

    async fn emit(&self, ev: SatEvent) {
        let _ = self.ui_events.send(ev).await;
    }

    pub async fn satellite_id(&self) -> Option<i64> {
        self.inner.lock().await.satellite_id
    }

    pub async fn phase(&self) -> Option<SessionPhase> {
        let session = self.inner.lock().await.session.clone()?;
        let phase = session.lock().await.phase();
        Some(phase)
    }

    // ── Pairing ─────────────────────────────────────────────────────────────

    /// Consume a scanned OOB token: register the device as pending, connect
    /// to the satellite, and run the handshake. Returns the satellite
    /// identity id the rest of the flow is keyed on.
    pub async fn accept_pairing_answer(
        &self,
        answer: &str,
        flip: Option<DiscoveryMode>,
    ) -> Result<i64, LinkError> {
        let token = PairingToken::decode(answer)?;
        if token.is_expired(Utc::now()) {
            return Err(LinkError::PairingExpired);
        }
        let sat_pub = token.sat_public_key()?;

        {
            let mut inner = self.inner.lock().await;
            inner.replay.check_and_insert(&token.nonce)?;
            if inner.session.is_some() {
                return Err(LinkError::HandshakeReject(
                    "another satellite session is active".into(),
                ));
            }
        }

        // Pending row + a host keypair minted for this binding alone.
        let name = format!("Satellite {}", &sat_pub.fingerprint()[..4]);
        let (device_id, _host_pub) = self.registry.register(&name, &sat_pub).await?;
        let host_keys = self.registry.host_keypair(device_id).await?;

        let establish_deadline = std::time::Duration::from_secs(self.cfg.pairing_deadline_secs);
        let out = async {
            let mut stream =
                discovery::host_establish(&token, flip.as_ref(), establish_deadline).await?;
            let nonce = token.nonce_bytes()?;
            let out = transport::initiate_handshake(
                &mut stream,
                HelloRole::Host,
                &host_keys,
                &nonce,
                Some(&sat_pub),
                &self.cfg,
            )
            .await?;
            Ok::<_, LinkError>((stream, out))
        }
        .await;
        let (stream, out) = match out {
            Ok(v) => v,
            Err(e) => {
                // Leave no orphaned pending row behind a failed handshake.
                let _ = self.registry.reject(device_id).await;
                return Err(e);
            }
        };

        let channel =
            transport::spawn_channel(stream, out.keys, Role::Host, out.peer_identity, &self.cfg);

        let sat_identity_id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_sat_identity;
            inner.next_sat_identity += 1;

            let mut state = SessionState::new(id, self.cfg.event_buffer_capacity);
            state.device_id = Some(device_id);
            let state = Arc::new(Mutex::new(state));

            inner.satellite_id = Some(id);
            inner.session = Some(state);
            inner.device_id = Some(device_id);
            inner.token_nonce = Some(token.nonce.clone());
            id
        };
        self.install_channel(channel).await;
        info!(sat_identity_id, device_id, "pairing channel established");
        Ok(sat_identity_id)
    }

    /// Wire a channel incarnation to the current session: swap the sender
    /// slot and spawn the router, pairing, and watcher tasks.
    async fn install_channel(&self, channel: Channel) {
        let (state, sat_identity_id, epoch) = {
            let mut inner = self.inner.lock().await;
            inner.sender = Some(channel.sender.clone());
            inner.epoch += 1;
            let state = inner.session.clone().expect("session installed before channel");
            (state, inner.satellite_id.unwrap_or_default(), inner.epoch)
        };

        let (pairing_tx, pairing_rx) = mpsc::channel(8);
        let hr = HostRouter {
            session: state,
            sender: channel.sender.clone(),
            engine: self.engine.clone(),
            mirror: self.mirror.clone(),
            pairing_tx,
        };
        tokio::spawn(router::host_channel_loop(hr, channel.inbound));
        tokio::spawn(self.clone().pairing_loop(pairing_rx, channel.sender.clone()));
        tokio::spawn(self.clone().channel_watcher(channel.status, sat_identity_id, epoch));
    }

    async fn pairing_loop(
        self,
        mut rx: mpsc::Receiver<(u64, PairingMsg)>,
        sender: ChannelSender,
    ) {
        while let Some((corr, msg)) = rx.recv().await {
            match msg {
                PairingMsg::SatRequestIdentity { identity } => {
                    if let Err(e) = self.handle_request_identity(corr, &identity, &sender).await {
                        warn!(error = %e, kind = e.kind(), "pairing request refused");
                        let _ = sender.send(e.to_reply(corr)).await;
                    }
                }
                PairingMsg::SatTerminateIdentity => {
                    let sat_identity_id =
                        self.inner.lock().await.satellite_id.unwrap_or_default();
                    let resp = serde_json::to_value(SatEvent::SatIdentityDisposed {
                        sat_identity_id,
                    })
                    .expect("lifecycle event serializes");
                    let _ = sender.send(Frame::Reply { id: corr, resp }).await;
                    sender.bye("terminated").await;
                    if let Err(e) = self.dispose(sat_identity_id).await {
                        warn!(error = %e, "dispose after terminate failed");
                    }
                }
                other => {
                    // Host-originated lifecycle messages have no business
                    // arriving from the satellite.
                    let tag = pairing_msg_tag(&other);
                    warn!(tag, "unexpected pairing message from satellite");
                    let err = LinkError::DeniedCommand { tag: tag.to_string() };
                    let _ = sender.send(err.to_reply(corr)).await;
                }
            }
        }
    }

    async fn handle_request_identity(
        &self,
        corr: u64,
        identity: &str,
        sender: &ChannelSender,
    ) -> Result<(), LinkError> {
        let token = PairingToken::decode(identity)?;
        if token.is_expired(Utc::now()) {
            return Err(LinkError::PairingExpired);
        }

        let (state, sat_identity_id) = {
            let inner = self.inner.lock().await;
            if inner.token_nonce.as_deref() != Some(token.nonce.as_str()) {
                return Err(LinkError::HandshakeReject(
                    "identity does not match the accepted token".into(),
                ));
            }
            let Some(state) = inner.session.clone() else {
                return Err(LinkError::SessionDisposed);
            };
            (state, inner.satellite_id.unwrap_or_default())
        };

        state.lock().await.transition(SessionPhase::Pairing)?;
        self.emit(SatEvent::SatRequestIdentity { identity: identity.to_string() }).await;

        let record = PairingMsg::SatIdentityRecord {
            sat_identity_id,
            identity: identity.to_string(),
        };
        let resp = serde_json::to_value(&record).expect("pairing message serializes");
        sender.send(Frame::Reply { id: corr, resp }).await?;

        // identityRecord keeps the session in Pairing; the host UI now owns
        // the confirm/reject decision.
        state.lock().await.transition(SessionPhase::Pairing)?;
        self.emit(SatEvent::SatIdentityRecord {
            sat_identity_id,
            identity: identity.to_string(),
        })
        .await;
        Ok(())
    }

    fn current(
        inner: &HostInner,
        sat_identity_id: i64,
    ) -> Result<(Arc<Mutex<SessionState>>, ChannelSender, i64), LinkError> {
        match (&inner.session, inner.satellite_id, &inner.sender, inner.device_id) {
            (Some(state), Some(id), Some(sender), Some(device_id)) if id == sat_identity_id => {
                Ok((state.clone(), sender.clone(), device_id))
            }
            _ => Err(LinkError::DeviceUnknown),
        }
    }

    /// Host UI approved the pending identity.
    pub async fn confirm_pairing(&self, sat_identity_id: i64) -> Result<(), LinkError> {
        let (state, sender, device_id) = {
            let inner = self.inner.lock().await;
            Self::current(&inner, sat_identity_id)?
        };
        self.registry.confirm(device_id).await?;
        state.lock().await.transition(SessionPhase::Active)?;

        let resp = serde_json::to_value(PairingMsg::SatIdentityConfirm { sat_identity_id })
            .expect("pairing message serializes");
        sender.send(Frame::Event { resp }).await?;
        self.emit(SatEvent::SatIdentityConfirmed { sat_identity_id }).await;
        info!(sat_identity_id, device_id, "satellite confirmed");
        Ok(())
    }

    /// Host UI declined: the pending row is deleted and the channel closed.
    pub async fn reject_pairing(&self, sat_identity_id: i64) -> Result<(), LinkError> {
        let (state, sender, device_id) = {
            let inner = self.inner.lock().await;
            Self::current(&inner, sat_identity_id)?
        };
        self.registry.reject(device_id).await?;
        state.lock().await.transition(SessionPhase::Idle)?;

        let resp = serde_json::to_value(PairingMsg::SatIdentityReject { sat_identity_id })
            .expect("pairing message serializes");
        let _ = sender.send(Frame::Event { resp }).await;
        sender.bye("rejected").await;
        self.clear_slots().await;
        self.emit(SatEvent::SatIdentityRejected { sat_identity_id }).await;
        Ok(())
    }

    // ── Foreground arbitration ──────────────────────────────────────────────

    /// The host's own UI takes the foreground: the satellite must stop
    /// issuing commands; events buffer until resume. The channel stays up.
    pub async fn takeover(&self) -> Result<(), LinkError> {
        let (state, sender, sat_identity_id) = {
            let inner = self.inner.lock().await;
            let id = inner.satellite_id.ok_or(LinkError::DeviceUnknown)?;
            let (state, sender, _) = Self::current(&inner, id)?;
            (state, sender, id)
        };
        state.lock().await.transition(SessionPhase::Suspended)?;

        let resp = serde_json::to_value(PairingMsg::SatTakeover)
            .expect("pairing message serializes");
        let _ = sender.send(Frame::Event { resp }).await;
        self.emit(SatEvent::SatTookOver { sat_identity_id }).await;
        Ok(())
    }

    /// Return the foreground to the satellite and flush buffered traffic.
    pub async fn resume(&self) -> Result<(), LinkError> {
        let (state, sender, sat_identity_id) = {
            let inner = self.inner.lock().await;
            let id = inner.satellite_id.ok_or(LinkError::DeviceUnknown)?;
            let (state, sender, _) = Self::current(&inner, id)?;
            (state, sender, id)
        };

        let frames = {
            let mut st = state.lock().await;
            st.transition(SessionPhase::Active)?;
            st.touch();
            st.drain_buffer()
        };
        let resp = serde_json::to_value(PairingMsg::SatResumed { sat_identity_id })
            .expect("pairing message serializes");
        sender.send(Frame::Event { resp }).await?;
        for frame in frames {
            let _ = sender.send(frame).await;
        }
        Ok(())
    }

    // ── Disposal ────────────────────────────────────────────────────────────

    async fn clear_slots(&self) {
        let mut inner = self.inner.lock().await;
        inner.satellite_id = None;
        inner.session = None;
        inner.sender = None;
        inner.device_id = None;
        inner.token_nonce = None;
    }

    /// Tear the session down. The device row keeps its status; only the
    /// channel dies. Disposing a disposed (or unknown) session is a no-op.
    pub async fn dispose(&self, sat_identity_id: i64) -> Result<(), LinkError> {
        let (state, sender) = {
            let mut inner = self.inner.lock().await;
            match (&inner.session, inner.satellite_id) {
                (Some(state), Some(id)) if id == sat_identity_id => {
                    let state = state.clone();
                    let sender = inner.sender.clone();
                    inner.satellite_id = None;
                    inner.session = None;
                    inner.sender = None;
                    inner.device_id = None;
                    inner.token_nonce = None;
                    (state, sender)
                }
                _ => return Ok(()), // idempotent
            }
        };
        if let Some(sender) = sender {
            sender.bye("disposed").await;
        }
        state.lock().await.dispose()?;
        self.emit(SatEvent::SatIdentityDisposed { sat_identity_id }).await;
        info!(sat_identity_id, "session disposed");
        Ok(())
    }

    /// Dispose and additionally revoke the device row: any future handshake
    /// from this satellite fails `DeviceRevoked`.
    pub async fn deregister(&self, sat_identity_id: i64) -> Result<(), LinkError> {
        let device_id = {
            let inner = self.inner.lock().await;
            match (inner.satellite_id, inner.device_id) {
                (Some(id), Some(device_id)) if id == sat_identity_id => Some(device_id),
                _ => None,
            }
        };
        if let Some(device_id) = device_id {
            self.registry.revoke(device_id).await?;
            // Let the satellite know before the channel drops.
            if let Some(sender) = self.inner.lock().await.sender.clone() {
                let resp =
                    serde_json::to_value(PairingMsg::SatIdentityDeregister { sat_identity_id })
                        .expect("pairing message serializes");
                let _ = sender.send(Frame::Event { resp }).await;
            }
        }
        self.dispose(sat_identity_id).await
    }

    // ── Reconnect ───────────────────────────────────────────────────────────

    /// Bind a listener for satellite reconnects and accept in the
    /// background. Returns the bound address for the embedding client to
    /// hand to the satellite.
    pub async fn spawn_reconnect_listener(
        &self,
        bind: SocketAddr,
    ) -> Result<SocketAddr, LinkError> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let ctl = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let ctl = ctl.clone();
                        tokio::spawn(async move {
                            if let Err(e) = ctl.attach_reconnect(stream).await {
                                warn!(%peer, error = %e, kind = e.kind(), "reconnect refused");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "reconnect listener failed");
                        break;
                    }
                }
            }
        });
        info!(%addr, "reconnect listener up");
        Ok(addr)
    }

    /// Authenticate a reconnecting satellite against the registry pins and
    /// splice the fresh channel into the suspended session.
    pub async fn attach_reconnect(&self, mut stream: TcpStream) -> Result<(), LinkError> {
        let hello = transport::read_peer_hello(&mut stream, &self.cfg).await?;
        let claimed = PublicKeyBytes::from_b64(&hello.identity_pub)?;

        let row = match self.registry.lookup(&claimed).await {
            Ok(row) => row,
            Err(StoreError::NotFound(_)) => return Err(LinkError::DeviceUnknown),
            Err(e) => return Err(e.into()),
        };
        match row.status().map_err(LinkError::from)? {
            DeviceStatus::Active => {}
            DeviceStatus::Revoked => {
                // Fatal for the session, not just the channel.
                let current = self.inner.lock().await.satellite_id;
                if let Some(id) = current {
                    let matches = self.inner.lock().await.device_id == Some(row.remote_device_id);
                    if matches {
                        let _ = self.dispose(id).await;
                    }
                }
                return Err(LinkError::DeviceRevoked);
            }
            DeviceStatus::Pending => {
                return Err(LinkError::HandshakeReject("device not confirmed".into()));
            }
        }

        let host_keys = self.registry.host_keypair(row.remote_device_id).await?;
        let expected = PublicKeyBytes(row.device_public_key.clone());
        let out = transport::respond_handshake(
            &mut stream,
            HelloRole::Host,
            &host_keys,
            &hello,
            Some(&expected),
            &self.cfg,
        )
        .await?;

        let state = {
            let inner = self.inner.lock().await;
            let Some(state) = inner.session.clone() else {
                return Err(LinkError::HandshakeReject("no session awaiting reconnect".into()));
            };
            if inner.device_id != Some(row.remote_device_id) {
                return Err(LinkError::HandshakeReject("different device is bound".into()));
            }
            state
        };
        // Single-active-session: a healthy channel refuses a second one.
        if state.lock().await.phase() != SessionPhase::Suspended {
            return Err(LinkError::HandshakeReject("session is not suspended".into()));
        }

        let channel =
            transport::spawn_channel(stream, out.keys, Role::Host, out.peer_identity, &self.cfg);
        let sender = channel.sender.clone();
        self.install_channel(channel).await;

        let frames = {
            let mut st = state.lock().await;
            st.transition(SessionPhase::Active)?;
            st.touch();
            st.drain_buffer()
        };
        debug!(buffered = frames.len(), "draining suspended traffic after reconnect");
        for frame in frames {
            let _ = sender.send(frame).await;
        }
        self.registry.touch(row.remote_device_id).await.ok();
        info!(device_id = row.remote_device_id, "satellite reconnected");
        Ok(())
    }

    /// Watch one channel incarnation and drive the session on break/close.
    async fn channel_watcher(
        self,
        mut status: watch::Receiver<ChannelStatus>,
        sat_identity_id: i64,
        epoch: u64,
    ) {
        let outcome = match status.wait_for(|s| *s != ChannelStatus::Up).await {
            Ok(s) => *s,
            Err(_) => ChannelStatus::Broken,
        };

        {
            let inner = self.inner.lock().await;
            if inner.satellite_id != Some(sat_identity_id) || inner.epoch != epoch {
                return; // stale watcher from a previous session or channel
            }
        }

        match outcome {
            ChannelStatus::Closed => {
                // Deliberate bye from the satellite.
                let _ = self.dispose(sat_identity_id).await;
            }
            ChannelStatus::Broken | ChannelStatus::Up => {
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
                            warn!(sat_identity_id, "channel broken; session suspended");
                            let _ = st.transition(SessionPhase::Suspended);
                        }
                        SessionPhase::Suspended => {}
                        // A break before the session went active: nothing to
                        // resume into, drop the whole attempt.
                        _ => {
                            drop(st);
                            let _ = self.dispose(sat_identity_id).await;
                            return;
                        }
                    }
                }

                // Outage budget: if nobody reconnected within the ceiling,
                // the session is gone.
                sleep(self.cfg.reconnect_ceiling()).await;
                let still_suspended = {
                    let inner = self.inner.lock().await;
                    inner.satellite_id == Some(sat_identity_id)
                        && inner.epoch == epoch
                        && match &inner.session {
                            Some(s) => s.lock().await.phase() == SessionPhase::Suspended,
                            None => false,
                        }
                };
                if still_suspended {
                    warn!(sat_identity_id, "reconnect ceiling reached; disposing session");
                    let _ = self.dispose(sat_identity_id).await;
                }
            }
        }
    }

    // ── Engine output ───────────────────────────────────────────────────────

    /// Pump the chat engine's output queue into the active channel. Run once
    /// for the controller's lifetime.
    pub async fn run_engine_output(&self, mut rx: mpsc::Receiver<EngineOutput>) {
        while let Some(out) = rx.recv().await {
            let (session, sender) = {
                let inner = self.inner.lock().await;
                (inner.session.clone(), inner.sender.clone())
            };
            let Some(session) = session else { continue };
            router::route_engine_output(&session, sender.as_ref(), out).await;
        }
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    pub async fn list_devices(
        &self,
    ) -> Result<Vec<rps_store::models::RemoteDeviceRow>, LinkError> {
        Ok(self.registry.list().await?)
    }

    /// Display fingerprint of the satellite key pinned for a device, for the
    /// host's verification UI.
    pub async fn device_fingerprint(&self, device_id: i64) -> Result<String, LinkError> {
        let row = self.registry.get(device_id).await?;
        Ok(PublicKeyBytes(row.device_public_key).fingerprint())
    }

    /// (frames sent, frames received, buffered, events dropped) for the
    /// current session.
    pub async fn session_stats(&self) -> Option<(u64, u64, usize, u64)> {
        let session = self.inner.lock().await.session.clone()?;
        let st = session.lock().await;
        Some((st.frames_sent, st.frames_received, st.buffered(), st.events_dropped))
    }
}

fn pairing_msg_tag(msg: &PairingMsg) -> &'static str {
    match msg {
        PairingMsg::SatRequestIdentity { .. } => "satRequestIdentity",
        PairingMsg::SatIdentityRecord { .. } => "satIdentityRecord",
        PairingMsg::SatIdentityConfirm { .. } => "satIdentityConfirm",
        PairingMsg::SatIdentityReject { .. } => "satIdentityReject",
        PairingMsg::SatTakeover => "satTakeover",
        PairingMsg::SatResumed { .. } => "satResumed",
        PairingMsg::SatTerminateIdentity => "satTerminateIdentity",
        PairingMsg::SatIdentityDeregister { .. } => "satIdentityDeregister",
    }
}
