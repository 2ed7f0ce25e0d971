//! Demo echo backend: the duplex-streaming service the scenarios exercise.

mod server;
mod service;

pub use server::EchoServer;
pub use service::{EXCHANGE_HEADERS_AND_SEND_MESSAGE, EXCHANGE_HEADERS_ONLY};

use thiserror::Error;

/// Echo backend error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("malformed client message: {0}")]
    Codec(#[from] crate::grpc::CodecError),

    #[error("client closed before sending a message")]
    UnexpectedEnd,
}
