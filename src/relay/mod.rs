//! Frame relay core.
//!
//! This module is transport-agnostic: it defines the frame vocabulary, the
//! per-direction forwarding loop with its phase machine, and the relay pair
//! that binds one client-side stream to one backend-side stream. The HTTP/2
//! endpoints are adapted onto the [`FrameSource`]/[`FrameSink`] traits by the
//! `proxy` module.

mod frame;
mod pair;
mod pump;

pub use frame::{
    Frame, FrameReceiver, FrameSender, FrameSink, FrameSource, Metadata, RequestHead, ResetReason,
    ResponseHead, frame_channel,
};
pub use pair::{PairOutcome, RelayPair, RelayPairHandle};
pub use pump::{Phase, pump};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Header forwarding discipline of a relay.
///
/// `Immediate` forwards every frame as soon as it is received. `BatchHeaders`
/// reproduces the forwarding defect this project demonstrates: a headers
/// frame is withheld until a later frame arrives to flush alongside it, which
/// stalls any peer that must observe headers before producing its next input.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingMode {
    #[default]
    Immediate,
    BatchHeaders,
}

impl ForwardingMode {
    /// Whether a headers frame is forwarded without waiting for more frames.
    pub fn forwards_headers_immediately(self) -> bool {
        matches!(self, ForwardingMode::Immediate)
    }
}

impl std::fmt::Display for ForwardingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardingMode::Immediate => write!(f, "immediate"),
            ForwardingMode::BatchHeaders => write!(f, "batch-headers"),
        }
    }
}

/// Direction of one forwarding loop within a relay pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Relay error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("frame channel closed")]
    ChannelClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<h2::Error> for RelayError {
    fn from(err: h2::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}
