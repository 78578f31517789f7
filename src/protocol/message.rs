//! Bayeux envelopes.
//!
//! Defines the wire format for handshake, subscribe, unsubscribe, connect and
//! disconnect requests and their responses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{
    is_meta_channel, BAYEUX_VERSION, CONNECTION_TYPE, META_CONNECT, META_DISCONNECT,
    META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE, MINIMUM_VERSION,
};
use crate::error::{RealtimeError, Result};

/// Envelope kind, derived from the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `/meta/handshake`
    Handshake,
    /// `/meta/subscribe`
    Subscribe,
    /// `/meta/unsubscribe`
    Unsubscribe,
    /// `/meta/connect`
    Connect,
    /// `/meta/disconnect`
    Disconnect,
    /// Unrecognised `/meta/*` channel
    UnknownMeta,
    /// Data published on an application channel
    Delivery,
}

impl MessageKind {
    /// Classify a channel name
    pub fn from_channel(channel: &str) -> Self {
        match channel {
            META_HANDSHAKE => Self::Handshake,
            META_SUBSCRIBE => Self::Subscribe,
            META_UNSUBSCRIBE => Self::Unsubscribe,
            META_CONNECT => Self::Connect,
            META_DISCONNECT => Self::Disconnect,
            other if is_meta_channel(other) => Self::UnknownMeta,
            _ => Self::Delivery,
        }
    }

    /// Whether this kind answers a client request
    pub fn is_meta(&self) -> bool {
        !matches!(self, Self::Delivery)
    }
}

/// Server reconnect advice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Issue the next connect
    Retry,
    /// The session is gone; a new handshake is required
    Handshake,
    /// Do not reconnect
    None,
}

/// Long-poll pacing advice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    /// Milliseconds the server may hold a connect open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Milliseconds to wait between connect cycles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Reconnect policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
}

impl Advice {
    /// Create advice with timeout and interval
    pub fn new(timeout_ms: u64, interval_ms: u64) -> Self {
        Self {
            timeout: Some(timeout_ms),
            interval: Some(interval_ms),
            reconnect: None,
        }
    }

    /// Take every field the other advice sets
    pub fn merge(&mut self, other: &Advice) {
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
        if other.interval.is_some() {
            self.interval = other.interval;
        }
        if other.reconnect.is_some() {
            self.reconnect = other.reconnect;
        }
    }

    /// Connect hold time
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(0))
    }

    /// Pause between cycles
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval.unwrap_or(0))
    }

    /// Whether the server told us not to issue another connect
    pub fn forbids_reconnect(&self) -> bool {
        matches!(
            self.reconnect,
            Some(Reconnect::Handshake | Reconnect::None)
        )
    }
}

/// Credential block of the handshake extension
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authn {
    /// `base64("tenant/user:password")`
    pub token: String,
    /// Two-factor token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfa: Option<String>,
    /// XSRF token for browser-originated sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xsrf_token: Option<String>,
}

impl fmt::Debug for Authn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authn")
            .field("token", &"<redacted>")
            .field("tfa", &self.tfa.as_ref().map(|_| "<redacted>"))
            .field("xsrf_token", &self.xsrf_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Request extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext {
    /// Credentials
    #[serde(rename = "com.cumulocity.authn")]
    pub authn: Authn,
    /// Unit system for pushed measurements
    #[serde(rename = "systemOfunits", alias = "systemOfUnits")]
    pub system_of_units: String,
}

/// Outbound envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation id
    pub id: String,
    /// Meta channel
    pub channel: String,
    /// Session id (absent before the handshake)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Authentication extension
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Ext>,
    /// Protocol version (handshake only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Minimum protocol version (handshake only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    /// Offered connection types (handshake only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    /// Chosen connection type (connect only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    /// Target channel (subscribe/unsubscribe only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    /// Pacing advice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
}

impl Request {
    fn base(id: &str, channel: &str) -> Self {
        Self {
            id: id.to_string(),
            channel: channel.to_string(),
            client_id: None,
            ext: None,
            version: None,
            minimum_version: None,
            supported_connection_types: None,
            connection_type: None,
            subscription: None,
            advice: None,
        }
    }

    /// Create a handshake request
    pub fn handshake(id: &str, ext: Ext, connection_types: Vec<String>, advice: Advice) -> Self {
        Self {
            ext: Some(ext),
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(MINIMUM_VERSION.to_string()),
            supported_connection_types: Some(connection_types),
            advice: Some(advice),
            ..Self::base(id, META_HANDSHAKE)
        }
    }

    /// Create a subscribe request
    pub fn subscribe(id: &str, client_id: &str, channel_path: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            subscription: Some(channel_path.to_string()),
            ..Self::base(id, META_SUBSCRIBE)
        }
    }

    /// Create an unsubscribe request
    pub fn unsubscribe(id: &str, client_id: &str, channel_path: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            subscription: Some(channel_path.to_string()),
            ..Self::base(id, META_UNSUBSCRIBE)
        }
    }

    /// Create a connect (long-poll) request
    pub fn connect(id: &str, client_id: &str, ext: Ext, advice: Advice) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ext: Some(ext),
            connection_type: Some(CONNECTION_TYPE.to_string()),
            advice: Some(advice),
            ..Self::base(id, META_CONNECT)
        }
    }

    /// Create a disconnect request
    pub fn disconnect(id: &str, client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::base(id, META_DISCONNECT)
        }
    }

    /// Envelope kind
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_channel(&self.channel)
    }

    /// Encode as a one-element message array
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&[self])?)
    }
}

/// Inbound envelope
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Correlation id echoed by the server (string or number on the wire)
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    /// Channel
    #[serde(default)]
    pub channel: String,
    /// Session id
    #[serde(default)]
    pub client_id: Option<String>,
    /// Outcome of a meta request
    #[serde(default)]
    pub successful: Option<bool>,
    /// Channel a subscribe/unsubscribe applied to
    #[serde(default, deserialize_with = "lenient_subscription")]
    pub subscription: Option<String>,
    /// Server error string, e.g. `401::Unauthorized`
    #[serde(default)]
    pub error: Option<String>,
    /// Pacing advice
    #[serde(default)]
    pub advice: Option<Advice>,
    /// Pushed payload
    #[serde(default)]
    pub data: Option<Value>,
    /// Extension block
    #[serde(default)]
    pub ext: Option<Value>,
    /// Server protocol version
    #[serde(default)]
    pub version: Option<String>,
    /// Server minimum version
    #[serde(default)]
    pub minimum_version: Option<String>,
    /// Connection types the server supports
    #[serde(default)]
    pub supported_connection_types: Option<Vec<String>>,
}

impl Response {
    /// Envelope kind
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_channel(&self.channel)
    }

    /// `successful: true` was present
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Pushed payload, if it carries anything
    pub fn payload(&self) -> Option<&Value> {
        match &self.data {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) if items.is_empty() => None,
            Some(value) => Some(value),
        }
    }

    /// Take the pushed payload, if it carries anything
    pub fn take_payload(&mut self) -> Option<Value> {
        if self.payload().is_some() {
            self.data.take()
        } else {
            None
        }
    }

    /// Reason to report for an unsuccessful response
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{} unsuccessful", self.channel))
    }
}

fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

fn lenient_subscription<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(channel)) => Some(channel),
        Some(Value::Array(channels)) => channels
            .into_iter()
            .find_map(|c| c.as_str().map(str::to_string)),
        _ => None,
    })
}

/// Decode one frame into its envelopes.
///
/// A frame is either a single object or an array of objects.
pub fn decode_frame(frame: &str) -> Result<Vec<Response>> {
    match serde_json::from_str::<Value>(frame)? {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(RealtimeError::from))
            .collect(),
        object @ Value::Object(_) => Ok(vec![serde_json::from_value(object)?]),
        other => Err(RealtimeError::InvalidMessage(format!(
            "expected object or array, got {other}"
        ))),
    }
}

/// Correlation id source, unique for the lifetime of a session
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator {
    /// Create a generator starting at 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id
    pub fn next_id(&self) -> String {
        self.next.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ext() -> Ext {
        Ext {
            authn: Authn {
                token: "dDEvYWxpY2U6c2VjcmV0".into(),
                tfa: None,
                xsrf_token: None,
            },
            system_of_units: "metric".into(),
        }
    }

    #[test]
    fn test_handshake_wire_shape() {
        let request = Request::handshake("1", ext(), vec!["websocket".into()], Advice::new(60000, 0));
        let wire: Value = serde_json::from_str(&request.encode().unwrap()).unwrap();

        let msg = &wire[0];
        assert_eq!(msg["channel"], "/meta/handshake");
        assert_eq!(msg["id"], "1");
        assert_eq!(msg["version"], "1.0");
        assert_eq!(msg["minimumVersion"], "1.0");
        assert_eq!(msg["supportedConnectionTypes"], json!(["websocket"]));
        assert_eq!(msg["advice"], json!({"timeout": 60000, "interval": 0}));
        assert_eq!(
            msg["ext"]["com.cumulocity.authn"]["token"],
            "dDEvYWxpY2U6c2VjcmV0"
        );
        assert_eq!(msg["ext"]["systemOfunits"], "metric");
        assert!(msg.get("clientId").is_none());
        assert!(msg["ext"]["com.cumulocity.authn"].get("tfa").is_none());
    }

    #[test]
    fn test_connect_and_subscribe_wire_shape() {
        let connect = Request::connect("7", "c1", ext(), Advice::new(1000, 0));
        let wire: Value = serde_json::to_value(&connect).unwrap();
        assert_eq!(wire["channel"], "/meta/connect");
        assert_eq!(wire["clientId"], "c1");
        assert_eq!(wire["connectionType"], "websocket");
        assert!(wire.get("subscription").is_none());

        let subscribe = Request::subscribe("8", "c1", "/operations/42");
        let wire: Value = serde_json::to_value(&subscribe).unwrap();
        assert_eq!(wire["channel"], "/meta/subscribe");
        assert_eq!(wire["subscription"], "/operations/42");
        assert!(wire.get("ext").is_none());
        assert_eq!(subscribe.kind(), MessageKind::Subscribe);
    }

    #[test]
    fn test_decode_object_and_array() {
        let single = decode_frame(r#"{"channel":"/meta/handshake","clientId":"c1","successful":true}"#)
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].client_id.as_deref(), Some("c1"));
        assert!(single[0].is_successful());

        let many = decode_frame(
            r#"[{"channel":"/operations/42","data":{"id":"9"}},
                {"id":"5","channel":"/meta/connect","successful":true}]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[0].kind(), MessageKind::Delivery);
        assert_eq!(many[1].kind(), MessageKind::Connect);
        assert_eq!(many[1].id.as_deref(), Some("5"));
    }

    #[test]
    fn test_decode_numeric_id_and_subscription_array() {
        let responses = decode_frame(
            r#"[{"id":12,"channel":"/meta/subscribe","successful":true,"subscription":["/alarms/1"]}]"#,
        )
        .unwrap();
        assert_eq!(responses[0].id.as_deref(), Some("12"));
        assert_eq!(responses[0].subscription.as_deref(), Some("/alarms/1"));
    }

    #[test]
    fn test_decode_rejects_scalars_and_garbage() {
        assert!(matches!(
            decode_frame("42"),
            Err(RealtimeError::InvalidMessage(_))
        ));
        assert!(matches!(decode_frame("{not json"), Err(RealtimeError::Json(_))));
    }

    #[test]
    fn test_payload_emptiness() {
        let mut response = Response {
            data: Some(json!(null)),
            ..Default::default()
        };
        assert!(response.payload().is_none());

        response.data = Some(json!([]));
        assert!(response.payload().is_none());
        assert!(response.take_payload().is_none());

        response.data = Some(json!({"foo": 1}));
        assert_eq!(response.take_payload(), Some(json!({"foo": 1})));
        assert!(response.data.is_none());
    }

    #[test]
    fn test_failure_reason() {
        let response = Response {
            channel: "/meta/subscribe".into(),
            successful: Some(false),
            error: Some("403::Forbidden".into()),
            ..Default::default()
        };
        assert_eq!(response.failure_reason(), "403::Forbidden");

        let bare = Response {
            channel: "/meta/subscribe".into(),
            ..Default::default()
        };
        assert_eq!(bare.failure_reason(), "/meta/subscribe unsuccessful");
    }

    #[test]
    fn test_advice_merge() {
        let mut advice = Advice::new(60000, 0);
        advice.merge(&Advice {
            timeout: Some(30000),
            interval: None,
            reconnect: Some(Reconnect::Retry),
        });
        assert_eq!(advice.timeout(), Duration::from_secs(30));
        assert_eq!(advice.interval(), Duration::ZERO);
        assert!(!advice.forbids_reconnect());

        advice.merge(&Advice {
            reconnect: Some(Reconnect::Handshake),
            ..Default::default()
        });
        assert!(advice.forbids_reconnect());
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.next_id(), "2");
        assert_eq!(ids.next_id(), "3");
    }

    #[test]
    fn test_authn_debug_redacts_token() {
        let rendered = format!("{:?}", ext());
        assert!(!rendered.contains("dDEvYWxpY2U6c2VjcmV0"));
        assert!(rendered.contains("<redacted>"));
    }
}
