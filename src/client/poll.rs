//! Long-poll connect cycle.
//!
//! One task per session. Each cycle issues a `/meta/connect` with a fresh id
//! and waits up to the advised timeout plus a local margin. An empty answer
//! or a timeout is a normal step: the next connect goes out immediately.
//!
//! ```text
//! Idle ──start_polling──► Polling ──stop_polling / reconnect advice──► Idle
//!                            │
//!                            └──── stop / transport failure ─────────► Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::events::Event;
use super::stats::ClientStats;
use super::writer::Outbox;
use crate::error::Result;
use crate::protocol::{Response, Session};

/// Poll loop state, as seen from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// No connect cycle running
    Idle,
    /// Connect cycles in progress
    Polling,
    /// The session is gone
    Stopped,
}

/// Why the poll loop exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PollExit {
    /// `stop_polling` or `stop`
    Stopped,
    /// Server advised against reconnecting
    Advised,
    /// Session torn down underneath the loop
    Closed(String),
}

/// Everything a poll loop needs from its client
pub(crate) struct PollContext {
    pub(crate) session: Arc<Mutex<Session>>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) outbox: Outbox,
    pub(crate) teardown: watch::Receiver<bool>,
    pub(crate) margin: Duration,
    pub(crate) buffer_length: usize,
    pub(crate) stats: Arc<ClientStats>,
}

/// Handle on a running poll loop
pub(crate) struct PollHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<PollExit>,
}

impl PollHandle {
    /// Attach to the dispatcher and start cycling.
    pub(crate) async fn spawn(ctx: PollContext) -> Result<Self> {
        let (push_tx, pushes) = mpsc::channel(ctx.buffer_length.max(1));
        let events = ctx.dispatcher.attach_poller(push_tx).await?;
        let (stop_tx, stop) = oneshot::channel();

        let poller = Poller {
            shutdown: ctx.teardown.clone(),
            ctx,
            pushes,
            events,
            stop,
        };
        let join = tokio::spawn(poller.run());

        Ok(Self {
            stop: Some(stop_tx),
            join,
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub(crate) async fn stop(mut self) -> PollExit {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => PollExit::Closed(format!("poll task failed: {e}")),
        }
    }
}

enum Step {
    Continue,
    Exit(PollExit),
}

struct Poller {
    ctx: PollContext,
    shutdown: watch::Receiver<bool>,
    pushes: mpsc::Receiver<Response>,
    events: mpsc::Sender<Event>,
    stop: oneshot::Receiver<()>,
}

impl Poller {
    async fn run(mut self) -> PollExit {
        info!("Poll loop started");

        let exit = loop {
            if let Step::Exit(exit) = self.cycle().await {
                break exit;
            }
        };

        self.ctx.dispatcher.detach_poller().await;
        info!(reason = ?exit, "Poll loop exited");
        exit
    }

    async fn closed(&self) -> PollExit {
        let reason = self
            .ctx
            .dispatcher
            .closed_reason()
            .await
            .map_or_else(|| "session torn down".to_string(), |r| r.to_error().to_string());
        PollExit::Closed(reason)
    }

    async fn cycle(&mut self) -> Step {
        match self.stop.try_recv() {
            Err(TryRecvError::Empty) => {},
            _ => return Step::Exit(PollExit::Stopped),
        }
        if *self.shutdown.borrow() {
            return Step::Exit(self.closed().await);
        }

        let id = self.ctx.dispatcher.next_id();
        let (request, wait) = {
            let session = self.ctx.session.lock().await;
            match session.connect_request(&id) {
                Ok(request) => (request, session.poll_wait(self.ctx.margin)),
                Err(e) => return Step::Exit(PollExit::Closed(e.to_string())),
            }
        };

        let mut reply = match self.ctx.dispatcher.register(&request).await {
            Ok(reply) => reply,
            Err(e) => return Step::Exit(PollExit::Closed(e.to_string())),
        };
        if let Err(e) = self.ctx.outbox.send(&request).await {
            self.ctx.dispatcher.cancel(&id).await;
            return Step::Exit(PollExit::Closed(e.to_string()));
        }
        self.ctx.stats.record_cycle();
        debug!(id = %id, wait_ms = wait.as_millis() as u64, "Connect cycle");

        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = &mut self.stop => {
                    self.ctx.dispatcher.cancel(&id).await;
                    return Step::Exit(PollExit::Stopped);
                }

                _ = super::torn_down(&mut self.shutdown) => {
                    return Step::Exit(self.closed().await);
                }

                Some(push) = self.pushes.recv() => {
                    if let Step::Exit(exit) = self.handle_push(push).await {
                        self.ctx.dispatcher.cancel(&id).await;
                        return Step::Exit(exit);
                    }
                }

                outcome = &mut reply => {
                    return match outcome {
                        Ok(Ok(response)) => self.handle_connect(response).await,
                        Ok(Err(e)) => Step::Exit(PollExit::Closed(e.to_string())),
                        Err(_) => Step::Exit(self.closed().await),
                    };
                }

                _ = &mut deadline => {
                    self.ctx.dispatcher.cancel(&id).await;
                    self.ctx.stats.record_timeout();
                    debug!(id = %id, "Connect cycle timed out, re-issuing");
                    return Step::Continue;
                }
            }
        }
    }

    async fn handle_connect(&mut self, mut response: Response) -> Step {
        let advice = self.ctx.session.lock().await.complete_connect(&response);

        if response.successful == Some(false) {
            warn!(
                id = response.id.as_deref().unwrap_or("-"),
                error = %response.failure_reason(),
                "Connect unsuccessful"
            );
        }

        if let Some(data) = response.take_payload() {
            let channel = std::mem::take(&mut response.channel);
            if let Step::Exit(exit) = self.emit(channel, data).await {
                return Step::Exit(exit);
            }
        }

        if response
            .advice
            .as_ref()
            .is_some_and(|advice| advice.forbids_reconnect())
        {
            info!(reconnect = ?advice.reconnect, "Server advised against reconnecting");
            return Step::Exit(PollExit::Advised);
        }

        let interval = advice.interval();
        if !interval.is_zero() {
            tokio::select! {
                biased;
                _ = &mut self.stop => return Step::Exit(PollExit::Stopped),
                _ = super::torn_down(&mut self.shutdown) => return Step::Exit(self.closed().await),
                _ = tokio::time::sleep(interval) => {},
            }
        }

        Step::Continue
    }

    async fn handle_push(&mut self, mut push: Response) -> Step {
        let Some(data) = push.take_payload() else {
            debug!(channel = %push.channel, "Empty push");
            return Step::Continue;
        };

        if push.kind().is_meta() {
            // Uncorrelated connect response carrying data
            let channel = std::mem::take(&mut push.channel);
            return self.emit(channel, data).await;
        }

        let subscribed = self.ctx.session.lock().await.is_subscribed(&push.channel);
        if !subscribed {
            debug!(channel = %push.channel, "Dropping delivery for inactive subscription");
            self.ctx.stats.record_dropped();
            return Step::Continue;
        }

        let channel = std::mem::take(&mut push.channel);
        self.emit(channel, data).await
    }

    /// Hand an event to the consumer, waiting for room.
    async fn emit(&mut self, channel: String, data: Value) -> Step {
        let event = Event { channel, data };

        tokio::select! {
            biased;

            _ = &mut self.stop => Step::Exit(PollExit::Stopped),

            _ = super::torn_down(&mut self.shutdown) => Step::Exit(self.closed().await),

            sent = self.events.send(event) => {
                match sent {
                    Ok(()) => self.ctx.stats.record_event(),
                    Err(mpsc::error::SendError(event)) => {
                        warn!(channel = %event.channel, "Event stream dropped, discarding event");
                    },
                }
                Step::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::writer;
    use crate::config::ClientConfig;
    use crate::protocol::Credentials;
    use crate::transport::{MemoryServer, MemoryTransport, Transport};
    use serde_json::json;

    struct Harness {
        server: MemoryServer,
        dispatcher: Arc<Dispatcher>,
        session: Arc<Mutex<Session>>,
        events: mpsc::Receiver<Event>,
        handle: PollHandle,
        _teardown: Arc<watch::Sender<bool>>,
    }

    async fn harness() -> Harness {
        let (client, server) = MemoryTransport::pair(16);
        let (sink, stream) = Box::new(client).split();
        let stats = Arc::new(ClientStats::new());
        let (events_tx, events) = mpsc::channel(8);
        let dispatcher = Arc::new(Dispatcher::new(events_tx, stats.clone()));
        let teardown = Arc::new(watch::channel(false).0);
        let (outbox, _) = writer::spawn(sink, 16, dispatcher.clone(), teardown.clone(), stats.clone());
        crate::client::reader::spawn(stream, dispatcher.clone(), teardown.clone());

        let config = ClientConfig::default().with_advice(Duration::from_millis(200), Duration::ZERO);
        let mut session = Session::new(&Credentials::new("t1", "alice", "pw"), &config);
        session.begin_handshake("0").unwrap();
        session
            .complete_handshake(&Response {
                channel: "/meta/handshake".into(),
                client_id: Some("c1".into()),
                successful: Some(true),
                ..Default::default()
            })
            .unwrap();
        let session = Arc::new(Mutex::new(session));

        let handle = PollHandle::spawn(PollContext {
            session: session.clone(),
            dispatcher: dispatcher.clone(),
            outbox,
            teardown: teardown.subscribe(),
            margin: Duration::from_millis(50),
            buffer_length: 8,
            stats,
        })
        .await
        .unwrap();

        Harness {
            server,
            dispatcher,
            session,
            events,
            handle,
            _teardown: teardown,
        }
    }

    fn id_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value[0]["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_connect_data_becomes_event() {
        let mut h = harness().await;

        let first = h.server.recv().await.unwrap();
        assert!(first.contains("/meta/connect"));
        let id = id_of(&first);
        h.server
            .send(
                json!([{"id": id, "channel": "/meta/connect", "successful": true, "data": {"foo": 1}}])
                    .to_string(),
            )
            .await
            .unwrap();

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.channel, "/meta/connect");
        assert_eq!(event.data, json!({"foo": 1}));

        let next = h.server.recv().await.unwrap();
        assert_ne!(id_of(&next), id);

        assert_eq!(h.handle.stop().await, PollExit::Stopped);
        assert_eq!(h.dispatcher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_reissues_connect() {
        let mut h = harness().await;

        let first = id_of(&h.server.recv().await.unwrap());
        // 200ms advice + 50ms margin, no answer
        let second = id_of(&h.server.recv().await.unwrap());
        assert_ne!(first, second);

        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_deliveries_follow_subscriptions() {
        let mut h = harness().await;
        h.server.recv().await.unwrap();

        h.server
            .send(r#"{"channel":"/alarms/7","data":{"text":"ignored"}}"#)
            .await
            .unwrap();

        h.session.lock().await.complete_subscribe(
            "/operations/42",
            &Response {
                successful: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        h.server
            .send(r#"{"channel":"/operations/42","data":{"id":"9"}}"#)
            .await
            .unwrap();

        let event = h.events.recv().await.unwrap();
        assert_eq!(event.channel, "/operations/42");
        assert_eq!(event.data, json!({"id": "9"}));

        h.handle.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_none_goes_idle() {
        let mut h = harness().await;

        let id = id_of(&h.server.recv().await.unwrap());
        h.server
            .send(
                json!([{"id": id, "channel": "/meta/connect", "successful": false,
                        "error": "402::Unknown client", "advice": {"reconnect": "none"}}])
                .to_string(),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.handle.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.handle.stop().await, PollExit::Advised);
    }
}
