//! rps_link — remote profile sessions over a secure duplex link
//!
//! A satellite UI (desktop) drives the chat engine on a host device (mobile)
//! while the host stays the single source of truth for user profiles. This
//! crate glues the registry, the crypto handshake, and the wire framing into
//! a restart-tolerant session:
//!
//! - `discovery`  — OOB token exchange and endpoint discovery (three modes)
//! - `transport`  — encrypted channel tasks, keepalive, broken detection
//! - `session`    — the Idle/Pairing/Active/Suspended/Disposed state machine
//! - `policy`     — the closed set of commands a satellite may run
//! - `router`     — host-side filter/forward/mirror, satellite correlation
//! - `controller` — host-side coordinator (one satellite at a time)
//! - `satellite`  — satellite-side coordinator (queueing, backoff reconnect)
//! - `engine`     — declared interface to the chat core's two queues
//! - `config`     — tunables with protocol defaults

pub mod config;
pub mod controller;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod policy;
pub mod router;
pub mod satellite;
pub mod session;
pub mod transport;

pub use config::LinkConfig;
pub use controller::HostController;
pub use error::LinkError;
pub use satellite::SatelliteController;
pub use session::SessionPhase;
