//! Event output.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

/// A pushed payload.
///
/// `data` is passed through untouched; interpreting it (an operation, an
/// alarm, ...) is up to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Channel the payload was published on (`/meta/connect` for data carried
    /// on the connect response itself)
    pub channel: String,
    /// Raw payload
    pub data: Value,
}

/// Bounded stream of [`Event`]s.
///
/// Ends once the session is stopped or torn down and buffered events are
/// drained. Nothing is dropped for lack of room: a slow consumer stalls the
/// reader and the next connect cycle until it catches up.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}
