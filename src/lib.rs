//! grelay - a minimal HTTP/2 gRPC-streaming forwarding proxy
//!
//! This crate provides:
//! - A forwarding proxy that relays gRPC duplex-streaming calls over HTTP/2,
//!   forwarding header frames the moment they arrive rather than batching
//!   them with later data frames
//! - A selectable defective forwarding mode that reproduces the
//!   header-batching bug the project demonstrates
//! - A trivial duplex-streaming echo backend and the client scenarios that
//!   probe the forwarding behavior

pub mod backend;
pub mod config;
pub mod grpc;
pub mod proxy;
pub mod relay;
pub mod scenarios;
pub mod tls;
pub mod util;

pub use config::Config;
