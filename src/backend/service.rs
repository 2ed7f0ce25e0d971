//! The echo service's two duplex-streaming methods.
//!
//! Both methods push their response headers the moment the request metadata
//! has been read; the headers-only variant then waits for a client message
//! before producing any data frame. That ordering is what the relayed
//! scenarios probe.

use crate::backend::BackendError;
use crate::grpc::{self, MessageBuffer};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use tracing::{debug, warn};

pub const EXCHANGE_HEADERS_ONLY: &str = "/echo.Echo/ExchangeHeadersOnly";
pub const EXCHANGE_HEADERS_AND_SEND_MESSAGE: &str = "/echo.Echo/ExchangeHeadersAndSendMessage";

/// Dispatch one accepted stream to its method handler.
pub(crate) async fn serve_stream(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
) -> Result<(), BackendError> {
    let path = request.uri().path().to_string();
    debug!(path = %path, "echo stream accepted");

    match path.as_str() {
        EXCHANGE_HEADERS_ONLY => exchange(request, respond, false).await,
        EXCHANGE_HEADERS_AND_SEND_MESSAGE => exchange(request, respond, true).await,
        _ => {
            warn!(path = %path, "unknown method");
            let mut response = http::Response::new(());
            *response.status_mut() = StatusCode::OK;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(grpc::CONTENT_TYPE_GRPC));
            response.headers_mut().insert(
                "grpc-status",
                HeaderValue::from_static("12"), // UNIMPLEMENTED, trailers-only
            );
            respond.send_response(response, true)?;
            Ok(())
        }
    }
}

/// The shared exchange: reply headers (echoing the client's header), then
/// optionally one eager message, then wait for one client message and answer
/// it.
async fn exchange(
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    eager_message: bool,
) -> Result<(), BackendError> {
    let (parts, mut body) = request.into_parts();

    let mut response = http::Response::new(());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(grpc::CONTENT_TYPE_GRPC));
    headers.insert("server-header", HeaderValue::from_static("server"));
    if let Some(value) = parts.headers.get("client-header") {
        headers.insert("client-header", value.clone());
    }

    // Headers go out before any message exists; a correct relay must pass
    // them through right away.
    let mut reply = respond.send_response(response, false)?;

    if eager_message {
        reply.send_data(grpc::encode_text("message-from-server"), false)?;
    }

    let client_message = read_message(&mut body).await?;
    debug!(message = %client_message, "client message received");

    reply.send_data(grpc::encode_text("reply-from-server"), false)?;
    reply.send_trailers(grpc::trailers(grpc::STATUS_OK))?;

    // Hold the request side open until the client half-closes so the stream
    // winds down without a reset racing the trailers.
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        body.flow_control().release_capacity(chunk.len())?;
    }
    Ok(())
}

/// Read one complete gRPC message from the request stream.
async fn read_message(body: &mut h2::RecvStream) -> Result<String, BackendError> {
    let mut buffer = MessageBuffer::new();
    loop {
        if let Some(payload) = buffer.try_decode()? {
            return Ok(grpc::decode_text(&payload)?);
        }
        match body.data().await {
            Some(chunk) => {
                let chunk = chunk?;
                body.flow_control().release_capacity(chunk.len())?;
                buffer.push(&chunk);
            }
            None => return Err(BackendError::UnexpectedEnd),
        }
    }
}
