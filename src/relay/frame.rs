//! Frame vocabulary and the frame channel pair.
//!
//! A relay direction is a sequence of frames: one headers frame, any number
//! of data frames, and optionally trailers; a reset terminates the stream
//! abruptly. Frames are immutable once produced and ownership transfers to
//! the relay on emission.
//!
//! [`FrameSource`] and [`FrameSink`] abstract the two ends of one direction.
//! The mpsc-backed [`frame_channel`] implementation preserves order, bounds
//! the outbound queue (send suspends under backpressure), signals orderly
//! end-of-stream by channel close, and carries resets as a distinct frame.

use crate::relay::RelayError;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::mpsc;

/// Request metadata carried by a headers frame on the client->backend side.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// Path and query, e.g. `/echo.Echo/ExchangeHeadersOnly`.
    pub path: String,
    pub headers: HeaderMap,
}

/// Response metadata carried by a headers frame on the backend->client side.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Metadata of a headers frame, tagged by which side produced it.
#[derive(Debug, Clone)]
pub enum Metadata {
    Request(RequestHead),
    Response(ResponseHead),
}

/// Why a stream was reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// The call was cancelled (peer teardown, shutdown).
    Cancel,
    /// The backend stream could not be opened.
    Refused,
    /// A frame arrived that is invalid in the stream's current phase.
    ProtocolError,
    /// Transport failure or internal error.
    Internal,
}

impl ResetReason {
    pub(crate) fn to_h2(self) -> h2::Reason {
        match self {
            ResetReason::Cancel => h2::Reason::CANCEL,
            ResetReason::Refused => h2::Reason::REFUSED_STREAM,
            ResetReason::ProtocolError => h2::Reason::PROTOCOL_ERROR,
            ResetReason::Internal => h2::Reason::INTERNAL_ERROR,
        }
    }

    pub(crate) fn from_h2(reason: h2::Reason) -> Self {
        match reason {
            h2::Reason::CANCEL => ResetReason::Cancel,
            h2::Reason::REFUSED_STREAM => ResetReason::Refused,
            h2::Reason::PROTOCOL_ERROR => ResetReason::ProtocolError,
            _ => ResetReason::Internal,
        }
    }
}

/// One protocol frame flowing through a relay direction.
#[derive(Debug, Clone)]
pub enum Frame {
    Headers { metadata: Metadata, end_stream: bool },
    Data { payload: Bytes, end_stream: bool },
    Trailers { metadata: HeaderMap },
    Reset { reason: ResetReason },
}

impl Frame {
    /// Short frame name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Headers { .. } => "headers",
            Frame::Data { .. } => "data",
            Frame::Trailers { .. } => "trailers",
            Frame::Reset { .. } => "reset",
        }
    }

    /// Whether this frame ends its direction of the stream.
    pub fn ends_stream(&self) -> bool {
        match self {
            Frame::Headers { end_stream, .. } | Frame::Data { end_stream, .. } => *end_stream,
            Frame::Trailers { .. } | Frame::Reset { .. } => true,
        }
    }
}

/// Receiving end of one relay direction.
pub trait FrameSource: Send {
    /// Receive the next frame. Suspends until one is available. `Ok(None)`
    /// signals orderly end-of-stream.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, RelayError>> + Send;
}

/// Sending end of one relay direction.
pub trait FrameSink: Send {
    /// Send a frame. May suspend under backpressure.
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), RelayError>> + Send;

    /// Signal orderly end-of-stream when no trailers or end-flagged frame
    /// already did.
    fn close(&mut self) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// Create a bounded, order-preserving frame channel.
pub fn frame_channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (FrameSender { tx: Some(tx) }, FrameReceiver { rx })
}

/// Channel-backed [`FrameSink`].
pub struct FrameSender {
    tx: Option<mpsc::Sender<Frame>>,
}

impl FrameSink for FrameSender {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        match &self.tx {
            Some(tx) => tx.send(frame).await.map_err(|_| RelayError::ChannelClosed),
            None => Err(RelayError::ChannelClosed),
        }
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        self.tx = None;
        Ok(())
    }
}

/// Channel-backed [`FrameSource`].
pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
}

impl FrameSource for FrameReceiver {
    async fn recv(&mut self) -> Result<Option<Frame>, RelayError> {
        Ok(self.rx.recv().await)
    }
}
