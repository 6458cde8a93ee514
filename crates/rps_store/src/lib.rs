//! rps_store — device registry for remote profile sessions
//!
//! The registry shares the chat store's SQLite database: remote devices get
//! their own table, and user rows grow two nullable columns binding them to
//! the device that announced them. Host binding keys are stored alongside
//! the device row so a restart can re-authenticate a known satellite without
//! re-pairing.
//!
//! All writes are expected to run under the controller lock that serializes
//! chat-store writes; this crate does not take its own.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod error;
pub mod models;
pub mod registry;

pub use db::Store;
pub use error::StoreError;
pub use registry::Registry;
