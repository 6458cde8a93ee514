//! rps_proto — wire types, framing, and the OOB pairing token
//!
//! All on-wire types are JSON, versioned where they cross a trust boundary.
//!
//! # Modules
//! - `frame`     — the channel frame sum type (cmd/reply/event/ping/pong/bye)
//! - `codec`     — length-prefixed record framing and size limits
//! - `token`     — `rp1:` out-of-band pairing token
//! - `hello`     — plaintext handshake messages carrying signed ephemerals
//! - `pairing`   — pairing wire messages and controller-surfaced responses

pub mod codec;
pub mod frame;
pub mod hello;
pub mod pairing;
pub mod token;

pub use codec::ProtoError;
pub use frame::Frame;
pub use token::PairingToken;
