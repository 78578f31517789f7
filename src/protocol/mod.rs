//! Bayeux envelope codec and session state.
//!
//! Implements the client half of the Bayeux/CometD meta-channel exchange used
//! by the realtime notification endpoint.
//!
//! # Protocol Overview
//!
//! ## Message Flow
//!
//! ```text
//! Client                                   Server
//!    |                                       |
//!    |---- /meta/handshake (authn ext) ---->|  Authenticate, get clientId
//!    |<--- clientId, advice ----------------|
//!    |                                       |
//!    |---- /meta/subscribe (channel) ------>|  Register interest
//!    |<--- successful ----------------------|
//!    |                                       |
//!    |---- /meta/connect ------------------>|  Long poll, held open
//!    |<--- data for /operations/42 ---------|  until data or timeout
//!    |<--- /meta/connect successful --------|
//!    |---- /meta/connect ------------------>|  Re-issued immediately
//!    |                                       |
//!    |---- /meta/disconnect --------------->|  Terminate session
//! ```
//!
//! ## Session States
//!
//! | State             | Description                        | Valid Transitions              |
//! |-------------------|------------------------------------|--------------------------------|
//! | `Unauthenticated` | Transport open, no clientId yet    | → Handshaking, Stopped         |
//! | `Handshaking`     | Handshake sent, awaiting response  | → Authenticated, Unauthenticated |
//! | `Authenticated`   | clientId known, ready to subscribe | → Stopped                      |
//! | `Stopped`         | Session terminated                 | (terminal)                     |
//!
//! ## Correlation
//!
//! Every outbound request carries a fresh `id` from [`IdGenerator`]. The
//! server echoes it on the matching meta-channel response, which is how the
//! client routes concurrent replies to the right waiter. Some servers leave
//! out the `id` or the `channel`; such replies are matched to the oldest
//! pending request on the same channel and subscription.

mod credentials;
mod message;
mod session;

pub use credentials::Credentials;
pub use message::{
    decode_frame, Advice, Authn, Ext, IdGenerator, MessageKind, Reconnect, Request, Response,
};
pub use session::{Session, SessionState};

/// Bayeux protocol version announced in the handshake
pub const BAYEUX_VERSION: &str = "1.0";

/// Oldest protocol version the client accepts
pub const MINIMUM_VERSION: &str = "1.0";

/// The only connection type this client implements
pub const CONNECTION_TYPE: &str = "websocket";

/// Handshake extension key carrying the credential token
pub const AUTHN_EXT: &str = "com.cumulocity.authn";

/// Handshake meta channel
pub const META_HANDSHAKE: &str = "/meta/handshake";

/// Subscribe meta channel
pub const META_SUBSCRIBE: &str = "/meta/subscribe";

/// Unsubscribe meta channel
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";

/// Long-poll meta channel
pub const META_CONNECT: &str = "/meta/connect";

/// Disconnect meta channel
pub const META_DISCONNECT: &str = "/meta/disconnect";

/// Check if a channel belongs to the `/meta/` namespace
pub fn is_meta_channel(channel: &str) -> bool {
    channel.starts_with("/meta/")
}
