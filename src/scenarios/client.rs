//! Duplex-streaming scenario client.
//!
//! A thin call object over an h2 client connection exposing the steps the
//! scenarios are written in: await the response metadata, send a message,
//! read a message, finish and collect the status.

use crate::grpc::{self, MessageBuffer};
use crate::scenarios::ScenarioError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Client side of one HTTP/2 connection to an echo endpoint.
pub struct EchoClient {
    sender: h2::client::SendRequest<Bytes>,
    authority: String,
}

impl EchoClient {
    /// Connect over TLS and perform the HTTP/2 handshake.
    pub async fn connect(
        addr: SocketAddr,
        tls: Arc<rustls::ClientConfig>,
    ) -> Result<Self, ScenarioError> {
        let tcp = TcpStream::connect(addr).await.map_err(ScenarioError::Connect)?;
        let _ = tcp.set_nodelay(true);

        let connector = TlsConnector::from(tls);
        let server_name = rustls::pki_types::ServerName::try_from(addr.ip().to_string())
            .map_err(|_| ScenarioError::Unexpected(format!("invalid server name for {addr}")))?;
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(ScenarioError::Connect)?;

        let (sender, connection) = h2::client::handshake(tls_stream).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "scenario connection terminated");
            }
        });

        Ok(Self {
            sender,
            authority: addr.to_string(),
        })
    }

    /// Open one duplex-streaming call.
    pub async fn call(
        &mut self,
        path: &str,
        metadata: &[(&str, &str)],
    ) -> Result<EchoCall, ScenarioError> {
        let uri = Uri::builder()
            .scheme("https")
            .authority(self.authority.as_str())
            .path_and_query(path)
            .build()
            .map_err(|err| ScenarioError::Unexpected(format!("invalid call uri: {err}")))?;

        let mut request = http::Request::new(());
        *request.method_mut() = Method::POST;
        *request.uri_mut() = uri;
        *request.version_mut() = Version::HTTP_2;

        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(grpc::CONTENT_TYPE_GRPC));
        headers.insert("te", HeaderValue::from_static("trailers"));
        for (name, value) in metadata {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ScenarioError::Unexpected(format!("invalid metadata name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| ScenarioError::Unexpected(format!("invalid metadata value: {err}")))?;
            headers.insert(name, value);
        }

        let mut sender = self.sender.clone().ready().await?;
        let (response, stream) = sender.send_request(request, false)?;

        Ok(EchoCall {
            response: Some(response),
            body: None,
            stream,
            buffer: MessageBuffer::new(),
        })
    }
}

/// One in-flight duplex-streaming call.
pub struct EchoCall {
    response: Option<h2::client::ResponseFuture>,
    body: Option<h2::RecvStream>,
    stream: h2::SendStream<Bytes>,
    buffer: MessageBuffer,
}

impl EchoCall {
    /// The await-headers step: resolves once the server's response metadata
    /// arrives, independent of any data frame.
    pub async fn response_headers(&mut self) -> Result<HeaderMap, ScenarioError> {
        let future = self.response.take().ok_or_else(|| {
            ScenarioError::Unexpected("response metadata already consumed".to_string())
        })?;
        let response = future.await?;
        let (parts, body) = response.into_parts();
        if parts.status != StatusCode::OK {
            return Err(ScenarioError::Unexpected(format!(
                "unexpected response status {}",
                parts.status
            )));
        }
        self.body = Some(body);
        Ok(parts.headers)
    }

    /// Send one message on the request stream.
    pub fn send_message(&mut self, text: &str) -> Result<(), ScenarioError> {
        self.stream.send_data(grpc::encode_text(text), false)?;
        Ok(())
    }

    /// Read the next message from the response stream.
    pub async fn next_message(&mut self) -> Result<String, ScenarioError> {
        let body = self.body.as_mut().ok_or_else(|| {
            ScenarioError::Unexpected("response metadata not yet received".to_string())
        })?;
        loop {
            if let Some(payload) = self.buffer.try_decode()? {
                return Ok(grpc::decode_text(&payload)?);
            }
            match body.data().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    body.flow_control().release_capacity(chunk.len())?;
                    self.buffer.push(&chunk);
                }
                None => {
                    return Err(ScenarioError::Unexpected(
                        "stream ended before a full message arrived".to_string(),
                    ));
                }
            }
        }
    }

    /// Half-close the request side, drain the response, and return the gRPC
    /// status carried by the trailers.
    pub async fn finish(&mut self) -> Result<Option<u32>, ScenarioError> {
        self.stream.send_data(Bytes::new(), true)?;

        let body = self.body.as_mut().ok_or_else(|| {
            ScenarioError::Unexpected("response metadata not yet received".to_string())
        })?;
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            body.flow_control().release_capacity(chunk.len())?;
            self.buffer.push(&chunk);
        }
        let trailers = body.trailers().await?;
        Ok(trailers.as_ref().and_then(grpc::status_from_trailers))
    }
}
