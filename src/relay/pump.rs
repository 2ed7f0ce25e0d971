//! Per-direction forwarding loop.
//!
//! Each relay direction runs one `pump` loop: receive a frame, advance the
//! phase machine, forward the frame. In `Immediate` mode a frame is forwarded
//! as soon as it is received; the loop never inspects the opposite direction
//! and never coalesces a headers frame with a later data frame, so the
//! latency of a headers frame is bounded by scheduling alone.

use crate::relay::{Direction, ForwardingMode, Frame, FrameSink, FrameSource, RelayError, ResetReason};
use crate::util::CancelToken;
use std::time::Duration;
use tracing::trace;

/// Phase of one relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No frame seen yet.
    Idle,
    /// Headers received and forwarded.
    HeadersSent,
    /// At least one data frame seen; more may follow indefinitely.
    Streaming,
    /// Trailers or an end-of-stream-flagged frame arrived.
    Closed,
    /// Reset from either side.
    Aborted,
}

impl Phase {
    /// Whether no further frames are admissible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Aborted)
    }

    /// Advance the phase for an incoming frame, rejecting frames that are
    /// invalid in the current phase.
    pub fn on_frame(self, frame: &Frame) -> Result<Phase, RelayError> {
        if let Frame::Reset { .. } = frame {
            return Ok(Phase::Aborted);
        }

        match (self, frame) {
            (Phase::Idle, Frame::Headers { end_stream, .. }) => Ok(if *end_stream {
                Phase::Closed
            } else {
                Phase::HeadersSent
            }),
            (Phase::Idle, Frame::Data { .. }) => {
                Err(RelayError::ProtocolViolation("data frame before headers"))
            }
            (Phase::Idle, Frame::Trailers { .. }) => {
                Err(RelayError::ProtocolViolation("trailers before headers"))
            }
            (Phase::HeadersSent | Phase::Streaming, Frame::Data { end_stream, .. }) => {
                Ok(if *end_stream {
                    Phase::Closed
                } else {
                    Phase::Streaming
                })
            }
            (Phase::HeadersSent | Phase::Streaming, Frame::Trailers { .. }) => Ok(Phase::Closed),
            (Phase::HeadersSent | Phase::Streaming, Frame::Headers { .. }) => {
                Err(RelayError::ProtocolViolation("duplicate headers frame"))
            }
            (Phase::Closed | Phase::Aborted, _) => {
                Err(RelayError::ProtocolViolation("frame after end of stream"))
            }
            // `Frame::Reset` is handled by the early return above, so these
            // combinations are unreachable.
            (_, Frame::Reset { .. }) => unreachable!("reset handled above"),
        }
    }
}

/// Run one forwarding loop until its direction reaches a terminal phase.
///
/// Cancellation is honored at every suspend point; an abort sends a reset to
/// the sink, bounded by `grace`, before the loop exits.
pub async fn pump<S, K>(
    mut source: S,
    mut sink: K,
    mode: ForwardingMode,
    cancel: CancelToken,
    direction: Direction,
    grace: Duration,
) -> Result<Phase, RelayError>
where
    S: FrameSource,
    K: FrameSink,
{
    let mut phase = Phase::Idle;
    // Only used in BatchHeaders mode.
    let mut held: Option<Frame> = None;

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                return abort(&mut sink, ResetReason::Cancel, grace).await;
            }
            received = source.recv() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                if let Some(headers) = held.take() {
                    sink.send(headers).await?;
                }
                sink.close().await?;
                return Ok(Phase::Closed);
            }
            Err(err) => {
                let _ = abort(&mut sink, ResetReason::Internal, grace).await;
                return Err(err);
            }
        };

        let next = match phase.on_frame(&frame) {
            Ok(next) => next,
            Err(err) => {
                let _ = abort(&mut sink, ResetReason::ProtocolError, grace).await;
                return Err(err);
            }
        };

        trace!(%direction, frame = frame.kind(), "forwarding frame");

        match mode {
            ForwardingMode::Immediate => {
                if let Some(aborted) = deliver(&mut sink, frame, &cancel, grace).await? {
                    return Ok(aborted);
                }
            }
            ForwardingMode::BatchHeaders => {
                // The defect under study: headers are withheld until another
                // frame is available to flush alongside them.
                if next == Phase::HeadersSent && matches!(frame, Frame::Headers { .. }) {
                    held = Some(frame);
                } else {
                    if let Some(headers) = held.take() {
                        if let Some(aborted) = deliver(&mut sink, headers, &cancel, grace).await? {
                            return Ok(aborted);
                        }
                    }
                    if let Some(aborted) = deliver(&mut sink, frame, &cancel, grace).await? {
                        return Ok(aborted);
                    }
                }
            }
        }

        phase = next;
        if phase.is_terminal() {
            return Ok(phase);
        }
    }
}

/// Forward one frame, racing cancellation. Returns `Some(Aborted)` when the
/// call was cancelled while the send was suspended on backpressure.
async fn deliver<K: FrameSink>(
    sink: &mut K,
    frame: Frame,
    cancel: &CancelToken,
    grace: Duration,
) -> Result<Option<Phase>, RelayError> {
    tokio::select! {
        _ = cancel.cancelled() => {
            let aborted = abort(sink, ResetReason::Cancel, grace).await?;
            Ok(Some(aborted))
        }
        sent = sink.send(frame) => {
            sent?;
            Ok(None)
        }
    }
}

/// Best-effort reset toward the sink, bounded by the grace period.
async fn abort<K: FrameSink>(
    sink: &mut K,
    reason: ResetReason,
    grace: Duration,
) -> Result<Phase, RelayError> {
    let _ = tokio::time::timeout(grace, sink.send(Frame::Reset { reason })).await;
    Ok(Phase::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Metadata, ResponseHead};
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn headers_frame(end_stream: bool) -> Frame {
        Frame::Headers {
            metadata: Metadata::Response(ResponseHead {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
            }),
            end_stream,
        }
    }

    fn data_frame(end_stream: bool) -> Frame {
        Frame::Data {
            payload: Bytes::from_static(b"x"),
            end_stream,
        }
    }

    fn trailers_frame() -> Frame {
        Frame::Trailers {
            metadata: HeaderMap::new(),
        }
    }

    #[test]
    fn test_phase_happy_path() {
        let phase = Phase::Idle.on_frame(&headers_frame(false)).unwrap();
        assert_eq!(phase, Phase::HeadersSent);

        let phase = phase.on_frame(&data_frame(false)).unwrap();
        assert_eq!(phase, Phase::Streaming);

        let phase = phase.on_frame(&data_frame(false)).unwrap();
        assert_eq!(phase, Phase::Streaming);

        let phase = phase.on_frame(&trailers_frame()).unwrap();
        assert_eq!(phase, Phase::Closed);
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_phase_headers_only_stream() {
        let phase = Phase::Idle.on_frame(&headers_frame(true)).unwrap();
        assert_eq!(phase, Phase::Closed);
    }

    #[test]
    fn test_phase_trailers_straight_after_headers() {
        let phase = Phase::Idle.on_frame(&headers_frame(false)).unwrap();
        let phase = phase.on_frame(&trailers_frame()).unwrap();
        assert_eq!(phase, Phase::Closed);
    }

    #[test]
    fn test_phase_data_before_headers_is_violation() {
        let err = Phase::Idle.on_frame(&data_frame(false)).unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
    }

    #[test]
    fn test_phase_duplicate_headers_is_violation() {
        let phase = Phase::Idle.on_frame(&headers_frame(false)).unwrap();
        let err = phase.on_frame(&headers_frame(false)).unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
    }

    #[test]
    fn test_phase_reset_aborts_from_any_state() {
        let reset = Frame::Reset {
            reason: ResetReason::Cancel,
        };
        assert_eq!(Phase::Idle.on_frame(&reset).unwrap(), Phase::Aborted);
        assert_eq!(Phase::Streaming.on_frame(&reset).unwrap(), Phase::Aborted);
        assert_eq!(Phase::Closed.on_frame(&reset).unwrap(), Phase::Aborted);
    }

    #[test]
    fn test_phase_frame_after_close_is_violation() {
        let err = Phase::Closed.on_frame(&data_frame(false)).unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
    }
}
