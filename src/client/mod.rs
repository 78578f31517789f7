//! Realtime client.
//!
//! [`RealtimeClient`] owns one transport connection and the tasks around it:
//!
//! ```text
//!   callers ──handshake/subscribe──┐            ┌──► reader loop ◄── transport
//!                                   ▼            │         │
//!   poll loop ──connect──► Outbox ► writer loop ─┘         ▼
//!       ▲                                             Dispatcher
//!       └──────────── pushes ◄──────────────────────── │  └─► correlated waiters
//!       │
//!       └──► EventStream
//! ```
//!
//! Every request that expects an answer registers its correlation id with the
//! dispatcher before it is written, so a subscribe issued while a connect is
//! in flight can never receive the connect's response or vice versa.
//!
//! # Example
//!
//! ```ignore
//! use realtime::{ClientConfig, Credentials, RealtimeClient};
//!
//! let credentials = Credentials::new("t100", "alice", "secret");
//! let client = RealtimeClient::start(credentials, "https://acme.example.com", ClientConfig::default()).await?;
//! client.subscribe("/operations/12345").await?;
//!
//! let mut events = client.take_events().await.unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{}: {}", event.channel, event.data);
//! }
//! ```

mod dispatcher;
mod events;
mod poll;
mod reader;
mod stats;
mod writer;

pub use events::{Event, EventStream};
pub use poll::PollState;
pub use stats::{ClientStats, StatsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{RealtimeError, Result};
use crate::protocol::{Credentials, Request, Response, Session, SessionState};
use crate::transport::{Connector, WsConnector};
use dispatcher::{CloseReason, Dispatcher};
use poll::{PollContext, PollHandle};
use writer::Outbox;

/// Resolves once teardown has been signalled (or its sender is gone).
pub(crate) async fn torn_down(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Client for the realtime notification endpoint
pub struct RealtimeClient {
    config: ClientConfig,
    session: Arc<Mutex<Session>>,
    dispatcher: Arc<Dispatcher>,
    outbox: Outbox,
    events: Mutex<Option<EventStream>>,
    teardown: Arc<watch::Sender<bool>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    poll: Mutex<Option<PollHandle>>,
    /// Serialises start_polling, stop_polling and stop
    lifecycle: Mutex<()>,
    stats: Arc<ClientStats>,
    transport_name: &'static str,
}

impl RealtimeClient {
    /// Connect over a websocket, handshake and start polling.
    pub async fn start(
        credentials: Credentials,
        address: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        Self::start_with(&WsConnector::new(), credentials, address, config).await
    }

    /// Connect through `connector`, handshake and start polling.
    ///
    /// A failed handshake stops the client before the error is returned.
    pub async fn start_with(
        connector: &dyn Connector,
        credentials: Credentials,
        address: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let client = Self::connect_with(connector, credentials, address, config).await?;

        if let Err(e) = client.handshake().await {
            if let Err(stop_err) = client.stop().await {
                debug!(error = %stop_err, "Stop after failed handshake failed");
            }
            return Err(e);
        }

        client.start_polling().await?;
        Ok(client)
    }

    /// Open the transport and start the reader and writer loops.
    ///
    /// The session is left `Unauthenticated`; call [`handshake`](Self::handshake)
    /// next.
    pub async fn connect_with(
        connector: &dyn Connector,
        credentials: Credentials,
        address: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        credentials.validate()?;

        let transport = connector.connect(address).await?;
        let transport_name = transport.name();
        info!(
            transport = transport_name,
            address,
            tenant = credentials.tenant(),
            "Connected"
        );

        let stats = Arc::new(ClientStats::new());
        let (events_tx, events_rx) = mpsc::channel(config.buffer_length.max(1));
        let dispatcher = Arc::new(Dispatcher::new(events_tx, stats.clone()));
        let teardown = Arc::new(watch::channel(false).0);

        let (sink, stream) = transport.split();
        let (outbox, writer) = writer::spawn(
            sink,
            config.buffer_length,
            dispatcher.clone(),
            teardown.clone(),
            stats.clone(),
        );
        let reader = reader::spawn(stream, dispatcher.clone(), teardown.clone());

        Ok(Self {
            session: Arc::new(Mutex::new(Session::new(&credentials, &config))),
            config,
            dispatcher,
            outbox,
            events: Mutex::new(Some(EventStream::new(events_rx))),
            teardown,
            io_tasks: Mutex::new(vec![writer, reader]),
            poll: Mutex::new(None),
            lifecycle: Mutex::new(()),
            stats,
            transport_name,
        })
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.session.lock().await.state() == SessionState::Stopped {
            return Err(RealtimeError::SessionStopped);
        }
        match self.dispatcher.closed_reason().await {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    /// Register, send and wait for the correlated response.
    async fn call(&self, request: Request, timeout: Duration) -> Result<Response> {
        let reply = self.dispatcher.register(&request).await?;
        if let Err(e) = self.outbox.send(&request).await {
            self.dispatcher.cancel(&request.id).await;
            return Err(e);
        }
        self.dispatcher
            .await_reply(&request.id, reply, timeout, &request.channel)
            .await
    }

    /// Perform the handshake and store the assigned client id.
    ///
    /// On rejection or timeout the session returns to `Unauthenticated`; the
    /// handshake may be attempted again.
    pub async fn handshake(&self) -> Result<String> {
        self.ensure_live().await?;

        let id = self.dispatcher.next_id();
        let request = self.session.lock().await.begin_handshake(&id)?;
        info!(id = %id, "Handshaking");

        match self.call(request, self.config.timeout()).await {
            Ok(response) => {
                let mut session = self.session.lock().await;
                session.complete_handshake(&response)?;
                let client_id = session.client_id().unwrap_or_default().to_string();
                info!(client_id = %client_id, "Handshake complete");
                Ok(client_id)
            },
            Err(e @ RealtimeError::Timeout { .. }) => {
                warn!(error = %e, "Handshake timed out");
                Err(self.session.lock().await.abort_handshake(e.to_string()))
            },
            Err(e) => {
                self.session.lock().await.abort_handshake(e.to_string());
                Err(e)
            },
        }
    }

    /// Subscribe to a channel.
    ///
    /// Safe while the poll loop is running.
    pub async fn subscribe(&self, channel: &str) -> Result<()> {
        self.ensure_live().await?;

        let id = self.dispatcher.next_id();
        let request = self.session.lock().await.subscribe_request(&id, channel)?;

        let response = self
            .call(request, self.config.timeout())
            .await
            .map_err(|e| subscription_error(channel, e))?;

        let mut session = self.session.lock().await;
        session.complete_subscribe(channel, &response)?;
        info!(
            channel,
            client_id = session.client_id().unwrap_or("-"),
            "Subscribed"
        );
        Ok(())
    }

    /// Unsubscribe from a channel.
    ///
    /// The channel leaves the local subscription set before the request is
    /// sent and stays out even if the server rejects the request.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_live().await?;

        let id = self.dispatcher.next_id();
        let request = {
            let mut session = self.session.lock().await;
            let request = session.unsubscribe_request(&id, channel)?;
            session.forget_subscription(channel);
            request
        };

        let response = self
            .call(request, self.config.timeout())
            .await
            .map_err(|e| subscription_error(channel, e))?;

        self.session
            .lock()
            .await
            .complete_unsubscribe(channel, &response)?;
        info!(channel, "Unsubscribed");
        Ok(())
    }

    /// Start the long-poll connect cycle.
    pub async fn start_polling(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.ensure_live().await?;
        if !self.session.lock().await.is_authenticated() {
            return Err(RealtimeError::NotAuthenticated);
        }

        let mut poll = self.poll.lock().await;
        if let Some(handle) = poll.take() {
            if handle.is_running() {
                *poll = Some(handle);
                return Err(RealtimeError::AlreadyPolling);
            }
            // Reap a loop that exited on its own
            let exit = handle.stop().await;
            debug!(reason = ?exit, "Reaped finished poll loop");
        }

        *poll = Some(
            PollHandle::spawn(PollContext {
                session: self.session.clone(),
                dispatcher: self.dispatcher.clone(),
                outbox: self.outbox.clone(),
                teardown: self.teardown.subscribe(),
                margin: self.config.poll_margin(),
                buffer_length: self.config.buffer_length,
                stats: self.stats.clone(),
            })
            .await?,
        );
        Ok(())
    }

    /// Stop the connect cycle and wait for the loop to exit.
    ///
    /// Subscriptions are kept. Does nothing if no loop is running.
    pub async fn stop_polling(&self) {
        let _guard = self.lifecycle.lock().await;
        self.halt_polling().await;
    }

    async fn halt_polling(&self) {
        let handle = self.poll.lock().await.take();
        if let Some(handle) = handle {
            let exit = handle.stop().await;
            debug!(reason = ?exit, "Poll loop stopped");
        }
    }

    /// Whether a connect cycle is running
    pub async fn is_polling(&self) -> bool {
        self.poll
            .lock()
            .await
            .as_ref()
            .is_some_and(PollHandle::is_running)
    }

    /// Poll loop state
    pub async fn poll_state(&self) -> PollState {
        if self.state().await == SessionState::Stopped {
            PollState::Stopped
        } else if self.is_polling().await {
            PollState::Polling
        } else {
            PollState::Idle
        }
    }

    /// Stop the session.
    ///
    /// Stops polling, sends a best-effort disconnect, closes the transport and
    /// fails every pending request with `SessionStopped`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.session.lock().await.state() == SessionState::Stopped {
            return Ok(());
        }

        self.halt_polling().await;

        if self.dispatcher.closed_reason().await.is_none() {
            let id = self.dispatcher.next_id();
            let request = self.session.lock().await.disconnect_request(&id);
            if let Some(request) = request {
                match self.call(request, self.config.disconnect_timeout()).await {
                    Ok(_) => debug!("Disconnect acknowledged"),
                    Err(e) => debug!(error = %e, "Disconnect not acknowledged"),
                }
            }
        }

        debug!(
            pending = self.dispatcher.pending_count().await,
            "Tearing down transport"
        );
        self.teardown.send_replace(true);
        let tasks: Vec<_> = self.io_tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "I/O task failed");
            }
        }

        self.dispatcher.close(CloseReason::Stopped).await;
        self.session.lock().await.stop();
        info!("Session stopped");
        Ok(())
    }

    /// Session state. `Stopped` once the transport has gone away.
    pub async fn state(&self) -> SessionState {
        if *self.teardown.borrow() {
            return SessionState::Stopped;
        }
        self.session.lock().await.state()
    }

    /// Server-assigned client id
    pub async fn client_id(&self) -> Option<String> {
        self.session.lock().await.client_id().map(str::to_string)
    }

    /// Active subscriptions
    pub async fn subscriptions(&self) -> Vec<String> {
        self.session.lock().await.subscriptions()
    }

    /// Take the event stream. Only the first call returns it.
    pub async fn take_events(&self) -> Option<EventStream> {
        self.events.lock().await.take()
    }

    /// Traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &'static str {
        self.transport_name
    }

    /// Effective configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.teardown.send_replace(true);
    }
}

fn subscription_error(channel: &str, err: RealtimeError) -> RealtimeError {
    match err {
        RealtimeError::Timeout { .. } => RealtimeError::Subscription {
            channel: channel.to_string(),
            reason: err.to_string(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, MemoryTransport};

    #[tokio::test]
    async fn test_invalid_config_rejected_before_connecting() {
        let connector = MemoryConnector::refusing();
        let config = ClientConfig::default().with_timeout(Duration::ZERO);
        let result = RealtimeClient::connect_with(
            &connector,
            Credentials::new("t1", "alice", "pw"),
            "memory",
            config,
        )
        .await;
        assert!(matches!(result, Err(RealtimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_calls_before_handshake() {
        let (transport, _server) = MemoryTransport::pair(4);
        let client = RealtimeClient::connect_with(
            &MemoryConnector::new(transport),
            Credentials::new("t1", "alice", "pw"),
            "memory",
            ClientConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(client.state().await, SessionState::Unauthenticated);
        assert_eq!(client.transport_name(), "memory");
        assert!(matches!(
            client.subscribe("/operations/1").await,
            Err(RealtimeError::NotAuthenticated)
        ));
        assert!(matches!(
            client.start_polling().await,
            Err(RealtimeError::NotAuthenticated)
        ));

        client.stop().await.unwrap();
        assert_eq!(client.poll_state().await, PollState::Stopped);
        assert!(matches!(
            client.handshake().await,
            Err(RealtimeError::SessionStopped)
        ));
    }

    #[test]
    fn test_subscription_error_mapping() {
        let err = subscription_error(
            "/a",
            RealtimeError::Timeout {
                context: "/meta/subscribe".into(),
                timeout_ms: 5,
            },
        );
        assert!(matches!(err, RealtimeError::Subscription { ref channel, .. } if channel == "/a"));
        assert!(matches!(
            subscription_error("/a", RealtimeError::SessionStopped),
            RealtimeError::SessionStopped
        ));
    }
}
