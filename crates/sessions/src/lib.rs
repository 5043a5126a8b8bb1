//! Session management for Duplex.
//!
//! A session is a client-supplied identity that survives channel reconnects
//! and thread switches. It binds at most one control channel and at most one
//! media channel at a time; rebinding a slot atomically evicts the previous
//! binding so downstream voice routing follows the newest channel.

pub mod registry;

pub use registry::{SessionInfo, SessionRegistry, SessionStats};
