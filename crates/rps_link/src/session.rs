//! Session state machine.
//!
//! Phases and legal transitions (identical on both roles):
//!
//! ```text
//! Idle ──requestIdentity──▶ Pairing
//! Pairing ──identityRecord──▶ Pairing      (host only)
//! Pairing ──identityConfirm──▶ Active
//! Pairing ──identityReject──▶ Idle
//! Active ──takeover / channelBroken──▶ Suspended
//! Suspended ──reconnect──▶ Active
//! Active | Suspended ──deregister / terminate──▶ Disposed
//! Disposed ── terminal
//! ```
//!
//! A suspended session refuses new commands but buffers chat-core frames up
//! to a bounded drop-oldest capacity, so a quick reconnect resumes delivery
//! without loss. Disposed is terminal: dispose again is a no-op, everything
//! else is illegal.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use rps_proto::Frame;

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Pairing,
    Active,
    Suspended,
    Disposed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Pairing => "pairing",
            SessionPhase::Active => "active",
            SessionPhase::Suspended => "suspended",
            SessionPhase::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

impl SessionPhase {
    fn allows(self, to: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, to),
            (Idle, Pairing)
                | (Pairing, Pairing)
                | (Pairing, Active)
                | (Pairing, Idle)
                | (Active, Suspended)
                | (Active, Disposed)
                | (Suspended, Active)
                | (Suspended, Disposed)
        )
    }
}

type PendingWaiter = oneshot::Sender<Result<Value, LinkError>>;

/// Per-session mutable state. Owned behind the controller lock; the session
/// writer task is the only mutator of the pending map and buffers.
pub struct SessionState {
    pub sat_identity_id: i64,
    pub device_id: Option<i64>,
    phase: SessionPhase,
    /// Satellite side: waiters keyed by correlation id, insertion-ordered.
    pending: BTreeMap<u64, PendingWaiter>,
    /// Host side: correlation ids of satellite-originated commands currently
    /// inside the engine. Survives channel breaks so replies emitted during
    /// an outage still correlate after reconnect.
    inflight: HashSet<u64>,
    /// Frames held back while suspended, oldest dropped first.
    buffer: VecDeque<Frame>,
    buffer_capacity: usize,
    pub events_dropped: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    last_activity: Instant,
}

impl SessionState {
    pub fn new(sat_identity_id: i64, buffer_capacity: usize) -> Self {
        Self {
            sat_identity_id,
            device_id: None,
            phase: SessionPhase::Idle,
            pending: BTreeMap::new(),
            inflight: HashSet::new(),
            buffer: VecDeque::new(),
            buffer_capacity,
            events_dropped: 0,
            frames_sent: 0,
            frames_received: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn transition(&mut self, to: SessionPhase) -> Result<(), LinkError> {
        if self.phase == SessionPhase::Disposed && to == SessionPhase::Disposed {
            return Ok(()); // idempotent dispose
        }
        if !self.phase.allows(to) {
            return Err(LinkError::IllegalTransition { from: self.phase, to });
        }
        debug!(
            sat_identity_id = self.sat_identity_id,
            from = %self.phase,
            to = %to,
            "session transition"
        );
        self.phase = to;
        Ok(())
    }

    /// Dispose, failing every waiter. Idempotent.
    pub fn dispose(&mut self) -> Result<(), LinkError> {
        if self.phase == SessionPhase::Disposed {
            return Ok(());
        }
        // Idle/Pairing sessions can be dropped without ceremony; the formal
        // transition only exists from Active/Suspended.
        if matches!(self.phase, SessionPhase::Active | SessionPhase::Suspended) {
            self.transition(SessionPhase::Disposed)?;
        } else {
            self.phase = SessionPhase::Disposed;
        }
        self.fail_all_pending(|| LinkError::SessionDisposed);
        self.buffer.clear();
        self.inflight.clear();
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == SessionPhase::Disposed
    }

    // ── Pending commands (satellite side) ───────────────────────────────────

    pub fn register_pending(&mut self, corr_id: u64, tx: PendingWaiter) {
        if self.pending.insert(corr_id, tx).is_some() {
            warn!(corr_id, "correlation id reused; previous waiter dropped");
        }
    }

    /// Remove and return the waiter for a correlation id, if still pending.
    /// Exactly one caller wins: a reply, or the timeout path.
    pub fn take_pending(&mut self, corr_id: u64) -> Option<PendingWaiter> {
        self.pending.remove(&corr_id)
    }

    pub fn fail_all_pending<F: Fn() -> LinkError>(&mut self, err: F) {
        for (corr_id, tx) in std::mem::take(&mut self.pending) {
            debug!(corr_id, "failing pending command");
            let _ = tx.send(Err(err()));
        }
    }

    // ── In-flight commands (host side) ──────────────────────────────────────

    pub fn mark_inflight(&mut self, corr_id: u64) {
        self.inflight.insert(corr_id);
    }

    pub fn clear_inflight(&mut self, corr_id: u64) -> bool {
        self.inflight.remove(&corr_id)
    }

    // ── Suspension buffer ───────────────────────────────────────────────────

    pub fn buffer_frame(&mut self, frame: Frame) {
        if self.buffer.len() >= self.buffer_capacity {
            self.buffer.pop_front();
            self.events_dropped += 1;
        }
        self.buffer.push_back(frame);
    }

    pub fn drain_buffer(&mut self) -> Vec<Frame> {
        self.buffer.drain(..).collect()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // ── Activity ────────────────────────────────────────────────────────────

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> SessionState {
        SessionState::new(7, 4)
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = session();
        s.transition(SessionPhase::Pairing).unwrap();
        s.transition(SessionPhase::Pairing).unwrap(); // identityRecord
        s.transition(SessionPhase::Active).unwrap();
        s.transition(SessionPhase::Suspended).unwrap();
        s.transition(SessionPhase::Active).unwrap();
        s.transition(SessionPhase::Disposed).unwrap();
    }

    #[test]
    fn reject_returns_to_idle() {
        let mut s = session();
        s.transition(SessionPhase::Pairing).unwrap();
        s.transition(SessionPhase::Idle).unwrap();
        s.transition(SessionPhase::Pairing).unwrap();
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut s = session();
        assert!(matches!(
            s.transition(SessionPhase::Active),
            Err(LinkError::IllegalTransition { .. })
        ));
        s.transition(SessionPhase::Pairing).unwrap();
        assert!(s.transition(SessionPhase::Suspended).is_err());
    }

    #[test]
    fn disposed_is_terminal_but_idempotent() {
        let mut s = session();
        s.transition(SessionPhase::Pairing).unwrap();
        s.transition(SessionPhase::Active).unwrap();
        s.dispose().unwrap();
        // Dispose again: success, no-op.
        s.dispose().unwrap();
        s.transition(SessionPhase::Disposed).unwrap();
        // Anything else from Disposed is illegal.
        assert!(s.transition(SessionPhase::Active).is_err());
        assert!(s.transition(SessionPhase::Pairing).is_err());
    }

    #[test]
    fn dispose_fails_pending_waiters() {
        let mut s = session();
        s.transition(SessionPhase::Pairing).unwrap();
        s.transition(SessionPhase::Active).unwrap();
        let (tx, rx) = oneshot::channel();
        s.register_pending(42, tx);
        s.dispose().unwrap();
        match rx.blocking_recv().unwrap() {
            Err(LinkError::SessionDisposed) => {}
            other => panic!("expected SessionDisposed, got {other:?}"),
        }
    }

    #[test]
    fn take_pending_resolves_exactly_once() {
        let mut s = session();
        let (tx, _rx) = oneshot::channel();
        s.register_pending(1, tx);
        assert!(s.take_pending(1).is_some());
        assert!(s.take_pending(1).is_none());
    }

    #[test]
    fn buffer_drops_oldest_beyond_capacity() {
        let mut s = session();
        for i in 0..6u64 {
            s.buffer_frame(Frame::Event { resp: json!({"n": i}) });
        }
        assert_eq!(s.events_dropped, 2);
        let drained = s.drain_buffer();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0], Frame::Event { resp: json!({"n": 2}) });
        assert_eq!(drained[3], Frame::Event { resp: json!({"n": 5}) });
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn inflight_tracking() {
        let mut s = session();
        s.mark_inflight(9);
        assert!(s.clear_inflight(9));
        assert!(!s.clear_inflight(9));
    }
}
