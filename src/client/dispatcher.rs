//! Inbound routing.
//!
//! Every decoded envelope goes to exactly one place:
//!
//! 1. the waiter registered under its correlation id. A reply without an id
//!    goes to the oldest pending request it can answer (same meta channel,
//!    same subscription). Ids on application channels are server-generated
//!    and never correlate.
//! 2. the poll loop, for connect data nobody waits for and for data on
//!    application channels. Handing over waits for room in the poll loop's
//!    queue, so a slow consumer holds back the reader instead of losing data.
//! 3. nowhere, with a warning. This includes late replies for requests that
//!    already timed out, unless they carry connect data.
//!
//! The registry of pending requests is owned here and guarded by one mutex.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::events::Event;
use super::stats::ClientStats;
use crate::error::{RealtimeError, Result};
use crate::protocol::{
    decode_frame, is_meta_channel, IdGenerator, MessageKind, Request, Response, META_CONNECT,
};

/// Receives the outcome of one correlated request.
pub(crate) type Reply = oneshot::Receiver<Result<Response>>;

/// Why the dispatcher stopped accepting requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// `stop` was called
    Stopped,
    /// The transport failed or was closed by the remote
    Transport(String),
}

impl CloseReason {
    pub(crate) fn to_error(&self) -> RealtimeError {
        match self {
            Self::Stopped => RealtimeError::SessionStopped,
            Self::Transport(reason) => RealtimeError::Connect(reason.clone()),
        }
    }
}

/// Where an envelope ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Correlated,
    Pushed,
    Dropped,
}

/// A request waiting for its reply
struct Pending {
    tx: oneshot::Sender<Result<Response>>,
    channel: String,
    subscription: Option<String>,
    seq: u64,
}

impl Pending {
    /// Whether a reply without an id can be attributed to this request
    fn answers(&self, response: &Response) -> bool {
        if response.channel.is_empty() {
            // Bare `{"successful":true, ...}`: anything but a connect, and
            // connect data is never mistaken for a reply
            response.payload().is_none()
                && self.channel != META_CONNECT
                && self.subscription == response.subscription
        } else {
            self.channel == response.channel
                && (response.subscription.is_none() || self.subscription == response.subscription)
        }
    }
}

#[derive(Default)]
struct Registry {
    pending: HashMap<String, Pending>,
    next_seq: u64,
    poller: Option<mpsc::Sender<Response>>,
    events: Option<mpsc::Sender<Event>>,
    closed: Option<CloseReason>,
}

impl Registry {
    fn take_waiter(&mut self, response: &Response) -> Option<Pending> {
        if !response.channel.is_empty() && !is_meta_channel(&response.channel) {
            return None;
        }
        if let Some(id) = response.id.as_deref() {
            return self.pending.remove(id);
        }

        let id = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.answers(response))
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(id, _)| id.clone())?;
        self.pending.remove(&id)
    }
}

/// Data the poll loop should see when no waiter claimed it
fn pushable(response: &Response) -> bool {
    if response.payload().is_none() {
        return false;
    }
    response.channel.is_empty()
        || matches!(response.kind(), MessageKind::Connect | MessageKind::Delivery)
}

pub(crate) struct Dispatcher {
    registry: Mutex<Registry>,
    ids: IdGenerator,
    stats: Arc<ClientStats>,
}

impl Dispatcher {
    pub(crate) fn new(events: mpsc::Sender<Event>, stats: Arc<ClientStats>) -> Self {
        Self {
            registry: Mutex::new(Registry {
                events: Some(events),
                ..Registry::default()
            }),
            ids: IdGenerator::new(),
            stats,
        }
    }

    /// Fresh correlation id
    pub(crate) fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Register a waiter for `request` before it is written.
    pub(crate) async fn register(&self, request: &Request) -> Result<Reply> {
        let mut registry = self.registry.lock().await;
        if let Some(reason) = &registry.closed {
            return Err(reason.to_error());
        }
        if registry.pending.contains_key(&request.id) {
            return Err(RealtimeError::InvalidMessage(format!(
                "correlation id {} is already pending",
                request.id
            )));
        }

        let (tx, rx) = oneshot::channel();
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry.pending.insert(
            request.id.clone(),
            Pending {
                tx,
                channel: request.channel.clone(),
                subscription: request.subscription.clone(),
                seq,
            },
        );
        Ok(rx)
    }

    /// Remove a waiter. Returns false if it was already gone.
    pub(crate) async fn cancel(&self, id: &str) -> bool {
        self.registry.lock().await.pending.remove(id).is_some()
    }

    /// Wait up to `timeout` for a registered reply.
    ///
    /// On timeout the registration is removed, so a late response is dropped
    /// as unmatched.
    pub(crate) async fn await_reply(
        &self,
        id: &str,
        reply: Reply,
        timeout: Duration,
        context: &str,
    ) -> Result<Response> {
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self
                .closed_reason()
                .await
                .map_or(RealtimeError::SessionStopped, |reason| reason.to_error())),
            Err(_) => {
                self.cancel(id).await;
                self.stats.record_timeout();
                debug!(id = %id, context, "Correlated request timed out");
                Err(RealtimeError::Timeout {
                    context: context.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            },
        }
    }

    pub(crate) async fn pending_count(&self) -> usize {
        self.registry.lock().await.pending.len()
    }

    pub(crate) async fn closed_reason(&self) -> Option<CloseReason> {
        self.registry.lock().await.closed.clone()
    }

    /// Route unsolicited pushes to a poll loop.
    ///
    /// Returns the event output the poll loop should publish to.
    pub(crate) async fn attach_poller(
        &self,
        pushes: mpsc::Sender<Response>,
    ) -> Result<mpsc::Sender<Event>> {
        let mut registry = self.registry.lock().await;
        if let Some(reason) = &registry.closed {
            return Err(reason.to_error());
        }
        let events = registry
            .events
            .clone()
            .ok_or(RealtimeError::SessionStopped)?;
        registry.poller = Some(pushes);
        Ok(events)
    }

    pub(crate) async fn detach_poller(&self) {
        self.registry.lock().await.poller = None;
    }

    /// Decode a frame and route each envelope in order.
    pub(crate) async fn dispatch(&self, frame: &str) -> Vec<Routed> {
        self.stats.record_received();

        match decode_frame(frame) {
            Ok(responses) => {
                let mut routed = Vec::with_capacity(responses.len());
                for response in responses {
                    routed.push(self.route(response).await);
                }
                routed
            },
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                self.stats.record_dropped();
                vec![Routed::Dropped]
            },
        }
    }

    async fn route(&self, mut response: Response) -> Routed {
        let poller = {
            let mut registry = self.registry.lock().await;

            if let Some(waiter) = registry.take_waiter(&response) {
                if response.channel.is_empty() {
                    response.channel = waiter.channel;
                }
                if waiter.tx.send(Ok(response)).is_err() {
                    debug!("Waiter went away before its response arrived");
                }
                return Routed::Correlated;
            }

            if pushable(&response) {
                registry.poller.clone()
            } else {
                None
            }
        };

        if let Some(poller) = poller {
            if response.channel.is_empty() {
                response.channel = META_CONNECT.to_string();
            }
            // Blocks the reader until the poll loop has room
            match poller.send(response).await {
                Ok(()) => return Routed::Pushed,
                Err(mpsc::error::SendError(returned)) => response = returned,
            }
        }

        warn!(
            channel = %response.channel,
            id = response.id.as_deref().unwrap_or("-"),
            "Dropping unmatched envelope"
        );
        self.stats.record_dropped();
        Routed::Dropped
    }

    /// Stop accepting requests and fail everything still waiting.
    ///
    /// The first reason sticks. Dropping the event sender here lets the
    /// event stream end once the poll loop is gone.
    pub(crate) async fn close(&self, reason: CloseReason) {
        let mut registry = self.registry.lock().await;
        let reason = registry.closed.get_or_insert(reason).clone();
        registry.poller = None;
        registry.events = None;

        for (id, waiter) in registry.pending.drain() {
            debug!(id = %id, "Cancelling pending request");
            let _ = waiter.tx.send(Err(reason.to_error()));
        }
    }
}
