//! gRPC wire conventions shared by the echo backend and the scenario client.
//!
//! The relay itself is data-agnostic and never touches this module; only the
//! endpoints that produce and consume the echo protocol do.

mod message;

pub use message::{CodecError, MessageBuffer, decode_text, encode_text};

use http::{HeaderMap, HeaderValue};

/// Content type every gRPC request and response carries.
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// gRPC status code: OK.
pub const STATUS_OK: u32 = 0;
/// gRPC status code: UNIMPLEMENTED.
pub const STATUS_UNIMPLEMENTED: u32 = 12;

/// Build the trailers that end a gRPC response.
pub fn trailers(status: u32) -> HeaderMap {
    let mut map = HeaderMap::new();
    map.insert("grpc-status", status_value(status));
    map
}

/// Extract the gRPC status code from trailers, if present and well-formed.
pub fn status_from_trailers(trailers: &HeaderMap) -> Option<u32> {
    trailers
        .get("grpc-status")?
        .to_str()
        .ok()?
        .parse::<u32>()
        .ok()
}

fn status_value(status: u32) -> HeaderValue {
    // Status codes are small integers; the ASCII rendering is always a valid
    // header value.
    HeaderValue::from_str(&status.to_string()).unwrap_or(HeaderValue::from_static("2"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailers_round_trip() {
        let map = trailers(STATUS_OK);
        assert_eq!(status_from_trailers(&map), Some(0));

        let map = trailers(STATUS_UNIMPLEMENTED);
        assert_eq!(status_from_trailers(&map), Some(12));
    }

    #[test]
    fn test_missing_status() {
        assert_eq!(status_from_trailers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_malformed_status() {
        let mut map = HeaderMap::new();
        map.insert("grpc-status", HeaderValue::from_static("not-a-number"));
        assert_eq!(status_from_trailers(&map), None);
    }
}
