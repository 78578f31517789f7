//! Writer loop.
//!
//! Owns the write half of the transport. Callers enqueue encoded frames
//! through an [`Outbox`]; frames go out in enqueue order.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::dispatcher::{CloseReason, Dispatcher};
use super::stats::ClientStats;
use crate::error::{RealtimeError, Result};
use crate::protocol::Request;
use crate::transport::FrameSink;

/// Queue in front of the writer loop
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<String>,
}

impl Outbox {
    /// Encode and enqueue a request.
    pub(crate) async fn send(&self, request: &Request) -> Result<()> {
        let frame = request.encode()?;
        debug!(channel = %request.channel, id = %request.id, "Sending");
        self.tx
            .send(frame)
            .await
            .map_err(|_| RealtimeError::Connect("writer loop has exited".to_string()))
    }
}

/// Start the writer loop.
///
/// A write failure closes the dispatcher and signals teardown; the loop
/// drains what is already queued when teardown comes from elsewhere.
pub(crate) fn spawn(
    mut sink: Box<dyn FrameSink>,
    capacity: usize,
    dispatcher: Arc<Dispatcher>,
    teardown: Arc<watch::Sender<bool>>,
    stats: Arc<ClientStats>,
) -> (Outbox, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
    let mut shutdown = teardown.subscribe();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = super::torn_down(&mut shutdown) => {
                    // Flush a disconnect queued just before teardown
                    while let Ok(frame) = rx.try_recv() {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                        stats.record_sent();
                    }
                    break;
                }

                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    trace!(len = frame.len(), "Writing frame");

                    if let Err(e) = sink.send(frame).await {
                        error!(error = %e, "Transport write failed");
                        dispatcher.close(CloseReason::Transport(e.to_string())).await;
                        teardown.send_replace(true);
                        break;
                    }
                    stats.record_sent();
                }
            }
        }

        if let Err(e) = sink.close().await {
            debug!(error = %e, "Transport close failed");
        }
        debug!("Writer loop exited");
    });

    (Outbox { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};

    fn setup() -> (
        Outbox,
        JoinHandle<()>,
        crate::transport::MemoryServer,
        Arc<Dispatcher>,
        Arc<watch::Sender<bool>>,
    ) {
        let (client, server) = MemoryTransport::pair(8);
        let (sink, _stream) = Box::new(client).split();
        let stats = Arc::new(ClientStats::new());
        let (events, _) = mpsc::channel(1);
        let dispatcher = Arc::new(Dispatcher::new(events, stats.clone()));
        let teardown = Arc::new(watch::channel(false).0);
        let (outbox, handle) = spawn(sink, 8, dispatcher.clone(), teardown.clone(), stats);
        (outbox, handle, server, dispatcher, teardown)
    }

    #[tokio::test]
    async fn test_frames_go_out_in_order() {
        let (outbox, _handle, mut server, _dispatcher, _teardown) = setup();

        outbox.send(&Request::subscribe("1", "c1", "/a")).await.unwrap();
        outbox.send(&Request::subscribe("2", "c1", "/b")).await.unwrap();

        let first = server.recv().await.unwrap();
        let second = server.recv().await.unwrap();
        assert!(first.contains(r#""id":"1""#));
        assert!(second.contains(r#""id":"2""#));
    }

    #[tokio::test]
    async fn test_teardown_closes_sink() {
        let (outbox, handle, mut server, _dispatcher, teardown) = setup();
        teardown.send_replace(true);
        handle.await.unwrap();

        assert!(server.recv().await.is_none());
        assert!(matches!(
            outbox.send(&Request::disconnect("3", "c1")).await,
            Err(RealtimeError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_write_failure_tears_down() {
        let (outbox, handle, server, dispatcher, teardown) = setup();
        let request = Request::subscribe("1", "c1", "/a");
        let pending = dispatcher.register(&request).await.unwrap();
        drop(server);

        outbox.send(&request).await.unwrap();
        handle.await.unwrap();

        assert!(*teardown.borrow());
        assert!(matches!(
            pending.await.unwrap(),
            Err(RealtimeError::Connect(_))
        ));
    }
}
