//! Per-call realtime voice-AI bridge engine.
//!
//! This crate implements the switch-independent half of the bridge: audio
//! codec/pacing/jitter handling, the event bus, the call state machine, the
//! heartbeat/timeout supervisor, provider drivers, tool dispatch, the
//! session orchestrator, the announced-transfer manager, config caching and
//! metrics/call logging. The switch-facing WebSocket server and the
//! FreeSWITCH ESL client live in `bridge-server`, which depends on this
//! crate.

pub mod audio;
pub mod bus;
pub mod config;
pub mod error;
pub mod fsm;
pub mod heartbeat;
pub mod metrics;
pub mod provider;
pub mod session;
pub mod switch;
pub mod tools;
pub mod transfer;

pub use error::{BridgeError, Result};
