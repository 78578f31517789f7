//! Transport layer abstraction for the realtime client.
//!
//! A transport is one duplex connection that moves whole JSON text frames.
//! Backends:
//! - **WebSocket**: `tokio-tungstenite`, `ws://` or `wss://`
//! - **Memory**: in-process pair for tests and embedders
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            RealtimeClient               │
//! │   writer loop           reader loop     │
//! └──────┬─────────────────────────▲────────┘
//!        │ FrameSink               │ FrameStream
//!        ▼                         │
//! ┌─────────────────────────────────────────┐
//! │      WsTransport | MemoryTransport      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The client splits a transport once; the halves are then owned by exactly
//! one task each, so frames are never written concurrently.

mod memory;
mod ws;

pub use memory::{MemoryConnector, MemoryServer, MemoryTransport};
pub use ws::{realtime_url, WsConnector, WsTransport, REALTIME_PATH};

use futures::future::BoxFuture;

use crate::error::Result;

/// Write half of a transport.
pub trait FrameSink: Send {
    /// Send one complete frame.
    fn send(&mut self, frame: String) -> BoxFuture<'_, Result<()>>;

    /// Close the connection gracefully.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Read half of a transport.
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// `None` means the remote closed the connection cleanly.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String>>>;
}

/// Duplex frame transport.
pub trait Transport: Send {
    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Split into independently owned halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>);
}

/// Opens transports.
pub trait Connector: Send + Sync {
    /// Open a connection to `address`.
    ///
    /// Fails with `RealtimeError::Connect` if the connection cannot be opened.
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Box<dyn Transport>>>;
}
