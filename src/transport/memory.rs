//! In-process transport.
//!
//! A pair of bounded channels standing in for a socket. The client gets a
//! [`MemoryTransport`], the other side a [`MemoryServer`] that reads the
//! client's frames and writes replies.

use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use super::{Connector, FrameSink, FrameStream, Transport};
use crate::error::{RealtimeError, Result};

/// Client end of an in-process connection.
#[derive(Debug)]
pub struct MemoryTransport {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
}

/// Remote end of an in-process connection.
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::Receiver<String>,
    outgoing: Option<mpsc::Sender<String>>,
}

impl MemoryTransport {
    /// Create a connected pair with room for `capacity` frames each way.
    pub fn pair(capacity: usize) -> (Self, MemoryServer) {
        let (to_server, from_client) = mpsc::channel(capacity.max(1));
        let (to_client, from_server) = mpsc::channel(capacity.max(1));
        (
            Self {
                outgoing: to_server,
                incoming: from_server,
            },
            MemoryServer {
                incoming: from_client,
                outgoing: Some(to_client),
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
        (
            Box::new(MemorySink {
                outgoing: Some(self.outgoing),
            }),
            Box::new(MemoryFrames {
                incoming: self.incoming,
            }),
        )
    }
}

struct MemorySink {
    outgoing: Option<mpsc::Sender<String>>,
}

impl FrameSink for MemorySink {
    fn send(&mut self, frame: String) -> BoxFuture<'_, Result<()>> {
        async move {
            let outgoing = self
                .outgoing
                .as_ref()
                .ok_or_else(|| RealtimeError::Connect("memory transport closed".to_string()))?;
            outgoing
                .send(frame)
                .await
                .map_err(|_| RealtimeError::Connect("memory peer hung up".to_string()))
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.outgoing = None;
        async { Ok(()) }.boxed()
    }
}

struct MemoryFrames {
    incoming: mpsc::Receiver<String>,
}

impl FrameStream for MemoryFrames {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<String>>> {
        async move { self.incoming.recv().await.map(Ok) }.boxed()
    }
}

impl MemoryServer {
    /// Next frame from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }

    /// Send a frame to the client.
    pub async fn send(&self, frame: impl Into<String>) -> Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| RealtimeError::Connect("memory server closed".to_string()))?;
        outgoing
            .send(frame.into())
            .await
            .map_err(|_| RealtimeError::Connect("memory client hung up".to_string()))
    }

    /// Close the connection; the client's reader sees end of stream.
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}

/// Hands out one pre-built [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryConnector {
    transport: Mutex<Option<MemoryTransport>>,
}

impl MemoryConnector {
    /// Connector that yields `transport` on the first connect.
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
        }
    }

    /// Connector whose every connect fails.
    pub fn refusing() -> Self {
        Self {
            transport: Mutex::new(None),
        }
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        let taken = self
            .transport
            .lock()
            .map_err(|_| RealtimeError::Connect("memory connector poisoned".to_string()))
            .and_then(|mut slot| {
                slot.take().ok_or_else(|| {
                    RealtimeError::Connect(format!("connection to {address} refused"))
                })
            });

        async move {
            let transport: Box<dyn Transport> = Box::new(taken?);
            Ok(transport)
        }
        .boxed()
    }
}
