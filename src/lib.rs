//! # wiremux
//!
//! A lightweight RPC runtime that multiplexes many logical call streams
//! over a single bidirectional byte transport (local IPC pipes, TCP
//! sockets, TLS-wrapped streams, in-process loopbacks) using a compact
//! 8-byte-header frame format.
//!
//! All four familiar call shapes are supported - unary, client-streaming,
//! server-streaming, and duplex - with plug-compatible marshalling: the
//! core moves `Bytes`, and typed helpers layer a codec on top.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): fixed 8-byte little-endian headers,
//!   incremental parsing with correct boundary handling, ref-counted
//!   payload leases for zero-copy forwarding.
//! - **Connection** ([`Connection`]): one reader task demultiplexing
//!   inbound frames onto a table of live streams, one writer task
//!   linearizing outbound frames with optional write coalescing.
//! - **Calls** ([`Client`], [`ServiceBuilder`]): clients allocate 16-bit
//!   stream ids and drive the call shape; servers bind method full-names
//!   to handlers - no runtime reflection.
//!
//! ## Example
//!
//! ```ignore
//! use wiremux::{Connection, ConnectionOptions, ServiceBuilder};
//!
//! let services = ServiceBuilder::new()
//!     .unary("/svc/echo", |text: String, _ctx| async move { Ok(text) })
//!     .build();
//!
//! let server = Connection::server(server_transport, services, Default::default());
//! let client = Connection::client(client_transport, Default::default());
//!
//! let reply: String = client
//!     .client_handle()
//!     .unary_msgpack("/svc/echo", &"hello".to_string())
//!     .await?;
//! ```

pub mod codec;
pub mod protocol;
pub mod transport;

mod client;
mod connection;
mod error;
mod options;
mod pool;
mod server;
mod status;
mod stream;
mod writer;

pub use client::{
    CallOptions, CancelHandle, Client, ClientStreamCall, DuplexCall, ServerStreamCall, UnaryCall,
};
pub use connection::Connection;
pub use error::{Result, WiremuxError};
pub use options::ConnectionOptions;
pub use pool::{BufferPool, PooledBuf};
pub use server::{
    BoxFuture, Handler, HandlerResult, Requests, Responder, ServerCall, ServerContext,
    ServiceBuilder, ServiceRegistry,
};
pub use status::{Status, StatusCode};
pub use stream::{MethodType, StreamState};
pub use writer::{OutboundFrame, WriteFlags, WriterConfig, WriterHandle};
