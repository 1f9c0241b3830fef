//! # AureRPC
//!
//! An RPC framework where clients invoke exported methods of registered
//! services by name over a stream socket, passing one argument and receiving
//! one reply. Every connection starts with a JSON-encoded option exchange
//! that negotiates the body codec, followed by multiplexed header/body
//! message pairs matched by sequence number.
//!
//! ## Features
//!
//! - **Self-framing codecs**: a self-describing binary codec (default) and a
//!   JSON codec, selected per connection during the handshake
//! - **Request multiplexing**: concurrent calls over a single connection with
//!   strict write ordering on both endpoints
//! - **Timeouts**: connect-and-handshake timeout on dial, per-request handle
//!   timeout on the server, caller-side deadlines and cancellation
//! - **HTTP-CONNECT upgrade**: dial an RPC connection through a fixed HTTP
//!   path
//! - **Service discovery**: random and round-robin selection over a static
//!   server set or a heartbeat-backed HTTP registry
//! - **Multi-server client**: load-balanced unicast calls and fail-fast
//!   broadcast over a cached pool of per-address clients

/// Error types and error handling utilities.
mod error;
pub use error::{Error, ErrorKind, Result};

/// Connection handshake options.
mod option;
pub use option::{ConnOption, MAGIC_NUMBER};

/// Stream abstraction and pre-handshake connection buffering.
mod socket;
pub use socket::RawStream;

/// Message framing: header/body codecs.
mod codec;
pub use codec::{CodecKind, Header, Payload};

/// Caller-side deadlines and cancellation.
mod context;
pub use context::Context;

/// Service registration and method dispatch.
mod service;
pub use service::{Method, MethodSnapshot, Service, ServiceSnapshot};

/// RPC server.
mod server;
pub use server::{DEFAULT_RPC_PATH, Server};

/// RPC client for a single connection.
mod client;
pub use client::{Call, Client};

/// Server-set discovery and selection.
mod discovery;
pub use discovery::{
    DEFAULT_UPDATE_TIMEOUT, Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode,
};

/// HTTP registry of live servers maintained via heartbeats.
mod registry;
pub use registry::{
    DEFAULT_REGISTRY_PATH, DEFAULT_REGISTRY_TIMEOUT, HEADER_SERVER, HEADER_SERVERS, Registry,
    heartbeat,
};

/// Multi-server client with load balancing and broadcast.
mod xclient;
pub use xclient::XClient;
