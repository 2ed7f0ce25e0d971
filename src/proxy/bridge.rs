//! Adapters binding HTTP/2 stream endpoints onto the relay's frame traits.
//!
//! Each relay pair owns four endpoints: the client's request stream and the
//! response channel back to it, plus the backend request stream and its
//! response. These adapters translate between h2 objects and [`Frame`]s so
//! the forwarding loops stay transport-agnostic. The client's request head
//! and the backend's response head travel as ordinary headers frames; the
//! backend stream is opened the moment the request-direction headers frame is
//! forwarded, and the response-direction source resolves as soon as the
//! backend's header frame arrives, with no dependency on body data.

use crate::relay::{
    Frame, FrameSink, FrameSource, Metadata, RelayError, RequestHead, ResetReason, ResponseHead,
};
use bytes::Bytes;
use tokio::sync::oneshot;

/// Frames arriving from the client's request stream.
pub(crate) struct ClientStreamSource {
    head: Option<(RequestHead, bool)>,
    body: h2::RecvStream,
    done: bool,
}

impl ClientStreamSource {
    pub(crate) fn new(request: http::Request<h2::RecvStream>) -> Self {
        let (parts, body) = request.into_parts();
        let end_stream = body.is_end_stream();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let head = RequestHead {
            method: parts.method,
            path,
            headers: parts.headers,
        };
        Self {
            head: Some((head, end_stream)),
            body,
            done: false,
        }
    }
}

impl FrameSource for ClientStreamSource {
    async fn recv(&mut self) -> Result<Option<Frame>, RelayError> {
        if let Some((head, end_stream)) = self.head.take() {
            self.done = end_stream;
            return Ok(Some(Frame::Headers {
                metadata: Metadata::Request(head),
                end_stream,
            }));
        }
        if self.done {
            return Ok(None);
        }
        recv_body_frame(&mut self.body, &mut self.done).await
    }
}

/// Frames leaving toward the backend: the headers frame opens the backend
/// stream, later frames feed its send side.
pub(crate) struct BackendStreamSink {
    authority: String,
    state: BackendSinkState,
}

enum BackendSinkState {
    Idle {
        sender: h2::client::SendRequest<Bytes>,
        response_tx: oneshot::Sender<h2::client::ResponseFuture>,
    },
    Open {
        stream: h2::SendStream<Bytes>,
    },
    Done,
}

impl BackendStreamSink {
    pub(crate) fn new(
        sender: h2::client::SendRequest<Bytes>,
        authority: String,
        response_tx: oneshot::Sender<h2::client::ResponseFuture>,
    ) -> Self {
        Self {
            authority,
            state: BackendSinkState::Idle { sender, response_tx },
        }
    }
}

impl FrameSink for BackendStreamSink {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Headers {
                metadata: Metadata::Request(head),
                end_stream,
            } => {
                let BackendSinkState::Idle {
                    sender,
                    response_tx,
                } = std::mem::replace(&mut self.state, BackendSinkState::Done)
                else {
                    return Err(RelayError::ProtocolViolation(
                        "headers on an open backend stream",
                    ));
                };
                let request = build_backend_request(&self.authority, head)?;
                let mut sender = sender.ready().await?;
                let (response, stream) = sender.send_request(request, end_stream)?;
                // The response direction may already be tearing down; the
                // dropped future then surfaces there as an abrupt close.
                let _ = response_tx.send(response);
                if !end_stream {
                    self.state = BackendSinkState::Open { stream };
                }
                Ok(())
            }
            Frame::Headers { .. } => Err(RelayError::ProtocolViolation(
                "response metadata on the request direction",
            )),
            Frame::Data {
                payload,
                end_stream,
            } => match &mut self.state {
                BackendSinkState::Open { stream } => {
                    send_data_frame(stream, payload, end_stream).await?;
                    if end_stream {
                        self.state = BackendSinkState::Done;
                    }
                    Ok(())
                }
                _ => Err(RelayError::ProtocolViolation("data frame before headers")),
            },
            Frame::Trailers { metadata } => {
                match std::mem::replace(&mut self.state, BackendSinkState::Done) {
                    BackendSinkState::Open { mut stream } => {
                        stream.send_trailers(metadata).map_err(RelayError::from)
                    }
                    _ => Err(RelayError::ProtocolViolation("trailers before headers")),
                }
            }
            Frame::Reset { reason } => {
                match std::mem::replace(&mut self.state, BackendSinkState::Done) {
                    BackendSinkState::Open { mut stream } => stream.send_reset(reason.to_h2()),
                    // Nothing opened upstream yet; dropping the response
                    // channel wakes the peer loop.
                    BackendSinkState::Idle { .. } | BackendSinkState::Done => {}
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        match std::mem::replace(&mut self.state, BackendSinkState::Done) {
            BackendSinkState::Open { mut stream } => stream
                .send_data(Bytes::new(), true)
                .map_err(RelayError::from),
            BackendSinkState::Idle { .. } | BackendSinkState::Done => Ok(()),
        }
    }
}

/// Frames arriving from the backend's response: the headers frame is produced
/// the moment the backend's response head resolves.
pub(crate) struct BackendResponseSource {
    state: BackendSourceState,
}

enum BackendSourceState {
    Pending {
        response_rx: oneshot::Receiver<h2::client::ResponseFuture>,
    },
    Streaming {
        body: h2::RecvStream,
    },
    Done,
}

impl BackendResponseSource {
    pub(crate) fn new(response_rx: oneshot::Receiver<h2::client::ResponseFuture>) -> Self {
        Self {
            state: BackendSourceState::Pending { response_rx },
        }
    }
}

impl FrameSource for BackendResponseSource {
    async fn recv(&mut self) -> Result<Option<Frame>, RelayError> {
        match std::mem::replace(&mut self.state, BackendSourceState::Done) {
            BackendSourceState::Pending { response_rx } => {
                let response = match response_rx.await {
                    Ok(future) => future.await,
                    // The request direction dropped before opening the
                    // backend stream.
                    Err(_) => {
                        return Ok(Some(Frame::Reset {
                            reason: ResetReason::Cancel,
                        }));
                    }
                };
                let response = match response {
                    Ok(response) => response,
                    Err(err) => return reset_or_error(err),
                };
                let (parts, body) = response.into_parts();
                let end_stream = body.is_end_stream();
                let head = ResponseHead {
                    status: parts.status,
                    headers: parts.headers,
                };
                if !end_stream {
                    self.state = BackendSourceState::Streaming { body };
                }
                Ok(Some(Frame::Headers {
                    metadata: Metadata::Response(head),
                    end_stream,
                }))
            }
            BackendSourceState::Streaming { mut body } => {
                let mut done = false;
                let frame = recv_body_frame(&mut body, &mut done).await;
                if !done {
                    self.state = BackendSourceState::Streaming { body };
                }
                frame
            }
            BackendSourceState::Done => Ok(None),
        }
    }
}

/// Frames leaving toward the client: the headers frame sends the response
/// head, later frames feed the response body stream.
pub(crate) struct ClientStreamSink {
    state: ClientSinkState,
}

enum ClientSinkState {
    Idle {
        respond: h2::server::SendResponse<Bytes>,
    },
    Open {
        stream: h2::SendStream<Bytes>,
    },
    Done,
}

impl ClientStreamSink {
    pub(crate) fn new(respond: h2::server::SendResponse<Bytes>) -> Self {
        Self {
            state: ClientSinkState::Idle { respond },
        }
    }
}

impl FrameSink for ClientStreamSink {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        match frame {
            Frame::Headers {
                metadata: Metadata::Response(head),
                end_stream,
            } => {
                let ClientSinkState::Idle { mut respond } =
                    std::mem::replace(&mut self.state, ClientSinkState::Done)
                else {
                    return Err(RelayError::ProtocolViolation(
                        "headers on an open response stream",
                    ));
                };
                let response = build_client_response(head);
                let stream = respond.send_response(response, end_stream)?;
                if !end_stream {
                    self.state = ClientSinkState::Open { stream };
                }
                Ok(())
            }
            Frame::Headers { .. } => Err(RelayError::ProtocolViolation(
                "request metadata on the response direction",
            )),
            Frame::Data {
                payload,
                end_stream,
            } => match &mut self.state {
                ClientSinkState::Open { stream } => {
                    send_data_frame(stream, payload, end_stream).await?;
                    if end_stream {
                        self.state = ClientSinkState::Done;
                    }
                    Ok(())
                }
                _ => Err(RelayError::ProtocolViolation("data frame before headers")),
            },
            Frame::Trailers { metadata } => {
                match std::mem::replace(&mut self.state, ClientSinkState::Done) {
                    ClientSinkState::Open { mut stream } => {
                        stream.send_trailers(metadata).map_err(RelayError::from)
                    }
                    _ => Err(RelayError::ProtocolViolation("trailers before headers")),
                }
            }
            Frame::Reset { reason } => {
                match std::mem::replace(&mut self.state, ClientSinkState::Done) {
                    ClientSinkState::Idle { mut respond } => respond.send_reset(reason.to_h2()),
                    ClientSinkState::Open { mut stream } => stream.send_reset(reason.to_h2()),
                    ClientSinkState::Done => {}
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), RelayError> {
        match std::mem::replace(&mut self.state, ClientSinkState::Done) {
            ClientSinkState::Open { mut stream } => stream
                .send_data(Bytes::new(), true)
                .map_err(RelayError::from),
            // The stream ended before any response head existed; reset so the
            // client is not left waiting on headers that cannot come.
            ClientSinkState::Idle { mut respond } => {
                respond.send_reset(h2::Reason::CANCEL);
                Ok(())
            }
            ClientSinkState::Done => Ok(()),
        }
    }
}

/// Receive the next body frame from an h2 receive stream, releasing
/// flow-control capacity as data is consumed.
async fn recv_body_frame(
    body: &mut h2::RecvStream,
    done: &mut bool,
) -> Result<Option<Frame>, RelayError> {
    match body.data().await {
        Some(Ok(payload)) => {
            body.flow_control()
                .release_capacity(payload.len())
                .map_err(RelayError::from)?;
            let end_stream = body.is_end_stream();
            if end_stream {
                *done = true;
            }
            Ok(Some(Frame::Data {
                payload,
                end_stream,
            }))
        }
        Some(Err(err)) => {
            *done = true;
            reset_or_error(err)
        }
        None => {
            *done = true;
            match body.trailers().await {
                Ok(Some(metadata)) => Ok(Some(Frame::Trailers { metadata })),
                Ok(None) => Ok(None),
                Err(err) => reset_or_error(err),
            }
        }
    }
}

/// Map a stream-level reset onto a reset frame; anything else is a transport
/// failure.
fn reset_or_error(err: h2::Error) -> Result<Option<Frame>, RelayError> {
    match err.reason() {
        Some(reason) => Ok(Some(Frame::Reset {
            reason: ResetReason::from_h2(reason),
        })),
        None => Err(err.into()),
    }
}

/// Send one data payload, respecting the send window. Large payloads are
/// chunked to whatever capacity the peer grants.
async fn send_data_frame(
    stream: &mut h2::SendStream<Bytes>,
    mut payload: Bytes,
    end_stream: bool,
) -> Result<(), RelayError> {
    if payload.is_empty() {
        return stream
            .send_data(payload, end_stream)
            .map_err(RelayError::from);
    }

    while !payload.is_empty() {
        stream.reserve_capacity(payload.len());
        let granted = match std::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(capacity)) if capacity > 0 => capacity,
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
            None => {
                return Err(RelayError::Transport(
                    "send stream closed before capacity was granted".to_string(),
                ));
            }
        };
        let chunk = payload.split_to(granted.min(payload.len()));
        let last = payload.is_empty();
        stream
            .send_data(chunk, end_stream && last)
            .map_err(RelayError::from)?;
    }
    Ok(())
}

fn build_backend_request(
    authority: &str,
    head: RequestHead,
) -> Result<http::Request<()>, RelayError> {
    let uri = http::Uri::builder()
        .scheme("https")
        .authority(authority)
        .path_and_query(head.path.as_str())
        .build()
        .map_err(|err| RelayError::Transport(format!("invalid upstream uri: {err}")))?;

    let mut request = http::Request::new(());
    *request.method_mut() = head.method;
    *request.uri_mut() = uri;
    *request.version_mut() = http::Version::HTTP_2;
    *request.headers_mut() = head.headers;
    Ok(request)
}

fn build_client_response(head: ResponseHead) -> http::Response<()> {
    let mut response = http::Response::new(());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}
