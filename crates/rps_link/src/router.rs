//! Command router and mirror.
//!
//! Host side: every `cmd` frame off the channel is classified before it can
//! touch the engine. Pairing traffic is diverted to the controller, denied
//! commands are answered with an error reply and never executed, and the
//! rest is injected into the engine input queue under the frame's
//! correlation id. Engine output flows the other way: replies echo the
//! correlation id of satellite-originated commands, everything else mirrors
//! as events — unless the session is suspended, in which case frames land in
//! the drop-oldest buffer until reconnect or resume.
//!
//! Satellite side: replies resolve the pending waiter for their correlation
//! id (orphans are dropped with a warning) and events are handed to the
//! local UI as if a local engine had emitted them.
//!
//! Neither loop ever blocks the transport reader for long: engine handoff
//! and UI dispatch go through bounded channels.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use rps_proto::{pairing::PairingMsg, Frame};

use crate::{
    engine::{EngineCommand, EngineHandle, EngineOutput},
    error::LinkError,
    policy::{self, CommandClass},
    session::{SessionPhase, SessionState},
    transport::ChannelSender,
};

// ── Host side ─────────────────────────────────────────────────────────────────

pub struct HostRouter {
    pub session: Arc<Mutex<SessionState>>,
    pub sender: ChannelSender,
    pub engine: EngineHandle,
    /// Mirror effects for the host's own UI (`apiChatRead` and friends).
    pub mirror: mpsc::Sender<Value>,
    /// Pairing traffic diverted to the controller: (corr id, message).
    pub pairing_tx: mpsc::Sender<(u64, PairingMsg)>,
}

/// Drive one channel incarnation until its inbound queue closes.
pub async fn host_channel_loop(router: HostRouter, mut inbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Cmd { id, cmd } => handle_host_cmd(&router, id, cmd).await,
            other => {
                warn!(?other, "unexpected frame kind from satellite; dropped");
            }
        }
    }
    debug!("host channel loop ended");
}

async fn handle_host_cmd(router: &HostRouter, id: u64, cmd: Value) {
    let Some(tag) = policy::command_tag(&cmd) else {
        let err = LinkError::DecodeError("command has no type tag".into());
        let _ = router.sender.send(err.to_reply(id)).await;
        return;
    };
    let tag = tag.to_string();

    if PairingMsg::is_pairing_tag(&tag) {
        match serde_json::from_value::<PairingMsg>(cmd) {
            Ok(msg) => {
                let _ = router.pairing_tx.send((id, msg)).await;
            }
            Err(e) => {
                let err = LinkError::DecodeError(e.to_string());
                let _ = router.sender.send(err.to_reply(id)).await;
            }
        }
        return;
    }

    // Ordinary chat commands are only legal on an active session.
    {
        let mut session = router.session.lock().await;
        match session.phase() {
            SessionPhase::Active => {
                session.touch();
                session.frames_received += 1;
            }
            SessionPhase::Disposed => {
                drop(session);
                let _ = router.sender.send(LinkError::SessionDisposed.to_reply(id)).await;
                return;
            }
            _ => {
                drop(session);
                let _ = router.sender.send(LinkError::SessionSuspended.to_reply(id)).await;
                return;
            }
        }
    }

    match policy::classify(&tag) {
        CommandClass::Denied(category) => {
            warn!(tag, ?category, corr_id = id, "denied satellite command");
            let err = LinkError::DeniedCommand { tag };
            let _ = router.sender.send(err.to_reply(id)).await;
        }
        CommandClass::Forward => {
            if policy::needs_host_mirror(&tag) {
                // Keep the host's own view in step with what the satellite
                // just changed.
                let _ = router.mirror.send(cmd.clone()).await;
            }
            router.session.lock().await.mark_inflight(id);
            if let Err(e) = router.engine.submit(EngineCommand { corr_id: id, cmd }).await {
                warn!(error = %e, corr_id = id, "engine input queue unavailable");
                router.session.lock().await.clear_inflight(id);
                let _ = router.sender.send(LinkError::ChannelBroken.to_reply(id)).await;
            }
        }
    }
}

/// Mirror one piece of engine output to the satellite. Called by the
/// controller's pump with whatever session/channel is current; the sender
/// changes on every reconnect, the session does not.
pub async fn route_engine_output(
    session: &Arc<Mutex<SessionState>>,
    sender: Option<&ChannelSender>,
    out: EngineOutput,
) {
    if out.log_only {
        return;
    }

    let mut session_guard = session.lock().await;
    let frame = match out.corr_id {
        Some(corr) if session_guard.clear_inflight(corr) => {
            Frame::Reply { id: corr, resp: out.resp }
        }
        // Host-originated replies and spontaneous output both mirror as
        // events; the satellite has no waiter for them.
        _ => Frame::Event { resp: out.resp },
    };

    match session_guard.phase() {
        SessionPhase::Active => {
            session_guard.frames_sent += 1;
            drop(session_guard);
            match sender {
                Some(sender) => {
                    if sender.send(frame.clone()).await.is_err() {
                        // Channel died under us — hold the frame for the
                        // reconnect drain.
                        session.lock().await.buffer_frame(frame);
                    }
                }
                None => session.lock().await.buffer_frame(frame),
            }
        }
        SessionPhase::Suspended => {
            session_guard.buffer_frame(frame);
        }
        SessionPhase::Disposed => {}
        _ => {} // no satellite attached yet; nothing to mirror
    }
}

// ── Satellite side ────────────────────────────────────────────────────────────

pub struct SatelliteRouter {
    pub session: Arc<Mutex<SessionState>>,
    /// Decoded events for the local UI, as if from a local engine.
    pub ui_events: mpsc::Sender<Value>,
    /// Pairing/lifecycle traffic diverted to the satellite controller.
    pub pairing_tx: mpsc::Sender<PairingMsg>,
}

/// Drive one channel incarnation on the satellite until inbound closes.
pub async fn satellite_channel_loop(router: SatelliteRouter, mut inbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Frame::Reply { id, resp } => {
                let mut session = router.session.lock().await;
                session.touch();
                match session.take_pending(id) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(resp));
                    }
                    None => {
                        warn!(corr_id = id, "orphan reply; dropped");
                    }
                }
            }
            Frame::Event { resp } => {
                let tag = policy::command_tag(&resp).unwrap_or_default().to_string();
                if PairingMsg::is_pairing_tag(&tag) {
                    match serde_json::from_value::<PairingMsg>(resp) {
                        Ok(msg) => {
                            let _ = router.pairing_tx.send(msg).await;
                        }
                        Err(e) => warn!(error = %e, "malformed pairing event"),
                    }
                } else {
                    router.session.lock().await.touch();
                    let _ = router.ui_events.send(resp).await;
                }
            }
            other => {
                warn!(?other, "unexpected frame kind from host; dropped");
            }
        }
    }
    debug!("satellite channel loop ended");
}
