//! # c8y-realtime - Realtime Notification Client
//!
//! Client for the Bayeux/CometD realtime endpoint of a device management
//! platform: authenticate once, subscribe to channels such as
//! `/operations/<deviceId>` or `/alarms/<deviceId>`, and receive pushed
//! payloads over one persistent websocket instead of polling REST resources.
//!
//! ## Features
//!
//! - **Correlated requests**: every meta request carries its own id, so
//!   subscribes can run while a long-poll connect is in flight
//! - **Long-poll cycle**: connect requests re-issued on empty answers and
//!   timeouts, paced by server advice
//! - **Bounded event output**: a [`EventStream`] that slows the poll loop
//!   down instead of dropping events
//! - **Pluggable transport**: websocket by default, in-memory pair for tests
//!
//! ## Architecture
//!
//! ```text
//! Client                                          Server
//!    |                                              |
//!    |------ /meta/handshake (credentials) ------->|
//!    |<----- clientId, advice ---------------------|
//!    |                                              |
//!    |------ /meta/subscribe /operations/42 ------>|
//!    |<----- successful ---------------------------|
//!    |                                              |
//!    |====== /meta/connect (held open) ===========>|
//!    |<===== /operations/42 {data} ================|
//!    |====== /meta/connect ========================>|
//!    |                                              |
//!    |------ /meta/disconnect -------------------->|
//! ```
//!
//! ### Session States
//!
//! ```text
//!                     handshake()
//!   [Unauthenticated] ──────────> [Handshaking]
//!          ▲                           │
//!          │ rejected / timed out      │ clientId assigned
//!          └───────────────────────────┤
//!                                      v
//!                               [Authenticated]
//!                                      │ stop() / transport failure
//!                                      v
//!                                 [Stopped]
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use realtime::{ClientConfig, Credentials, RealtimeClient};
//!
//! let credentials = Credentials::new("t100", "alice", "secret");
//! let client = RealtimeClient::start(credentials, "https://acme.example.com", ClientConfig::default())
//!     .await?;
//!
//! client.subscribe("/operations/12345").await?;
//!
//! let mut events = client.take_events().await.expect("first call");
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.channel, event.data);
//! }
//!
//! client.stop().await?;
//! ```
//!
//! ## Modules
//!
//! - [`client`]: Session engine, poll loop and event output
//! - [`protocol`]: Envelopes, credentials and the session state machine
//! - [`transport`]: Websocket and in-memory transports
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientStats, Event, EventStream, PollState, RealtimeClient, StatsSnapshot};
pub use config::{ClientConfig, Config, ConnectionConfig};
pub use error::{RealtimeError, Result};
pub use protocol::{Credentials, Session, SessionState};
pub use transport::{Connector, MemoryConnector, MemoryServer, MemoryTransport, WsConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bayeux protocol version
pub const BAYEUX_VERSION: &str = protocol::BAYEUX_VERSION;
