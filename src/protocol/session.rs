//! Session state for the realtime protocol.
//!
//! Pure state machine: builds outbound requests, checks state preconditions
//! and applies responses. It performs no I/O; the client drives it.

use std::collections::BTreeSet;
use std::time::Duration;

use super::credentials::Credentials;
use super::message::{Advice, Authn, Ext, Request, Response};
use crate::config::ClientConfig;
use crate::error::{RealtimeError, Result};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, no handshake completed
    Unauthenticated,
    /// Handshake sent, waiting for the response
    Handshaking,
    /// clientId assigned, ready for subscriptions and polling
    Authenticated,
    /// Session terminated
    Stopped,
}

/// Realtime protocol session
#[derive(Debug)]
pub struct Session {
    /// Server-assigned id, set by a successful handshake
    client_id: Option<String>,
    /// Current state
    state: SessionState,
    /// Credential block sent with handshake and connect
    authn: Authn,
    /// Unit system announced to the server
    system_of_units: String,
    /// Connection types offered in the handshake
    connection_types: Vec<String>,
    /// Advice in effect (requested, then overridden by the server)
    advice: Advice,
    /// Channels with an active subscription
    subscriptions: BTreeSet<String>,
}

impl Session {
    /// Create an unauthenticated session
    pub fn new(credentials: &Credentials, config: &ClientConfig) -> Self {
        Self {
            client_id: None,
            state: SessionState::Unauthenticated,
            authn: credentials.authn(),
            system_of_units: config.system_of_units.clone(),
            connection_types: config.supported_connection_types.clone(),
            advice: config.advice(),
            subscriptions: BTreeSet::new(),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the server-assigned client id
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Credential token sent in the handshake
    pub fn credentials_token(&self) -> &str {
        &self.authn.token
    }

    /// Unit system announced in the handshake
    pub fn system_of_units(&self) -> &str {
        &self.system_of_units
    }

    /// Advice currently in effect
    pub fn advice(&self) -> Advice {
        self.advice
    }

    /// Check if the handshake has completed
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// Check if a channel has an active subscription
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    /// Active subscriptions in channel order
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }

    /// How long one connect cycle may take before it is re-issued
    pub fn poll_wait(&self, margin: Duration) -> Duration {
        self.advice.timeout() + margin
    }

    fn ext(&self) -> Ext {
        Ext {
            authn: self.authn.clone(),
            system_of_units: self.system_of_units.clone(),
        }
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        if self.state == SessionState::Stopped {
            return Err(RealtimeError::SessionStopped);
        }
        Ok(())
    }

    fn authenticated_client_id(&self) -> Result<&str> {
        self.ensure_not_stopped()?;
        match (self.state, self.client_id.as_deref()) {
            (SessionState::Authenticated, Some(client_id)) => Ok(client_id),
            _ => Err(RealtimeError::NotAuthenticated),
        }
    }

    /// Build the handshake request and enter `Handshaking`
    pub fn begin_handshake(&mut self, id: &str) -> Result<Request> {
        self.ensure_not_stopped()?;
        if self.state != SessionState::Unauthenticated {
            return Err(RealtimeError::Handshake(format!(
                "Cannot handshake in state {:?}",
                self.state
            )));
        }

        self.state = SessionState::Handshaking;
        Ok(Request::handshake(
            id,
            self.ext(),
            self.connection_types.clone(),
            self.advice,
        ))
    }

    /// Apply the handshake response
    pub fn complete_handshake(&mut self, response: &Response) -> Result<()> {
        if self.state != SessionState::Handshaking {
            return Err(RealtimeError::Handshake(format!(
                "Cannot process handshake response in state {:?}",
                self.state
            )));
        }

        if let Some(advice) = &response.advice {
            self.advice.merge(advice);
        }

        match response.client_id.as_deref() {
            Some(client_id) if response.is_successful() && !client_id.is_empty() => {
                self.client_id = Some(client_id.to_string());
                self.state = SessionState::Authenticated;
                Ok(())
            },
            _ if response.is_successful() => {
                Err(self.abort_handshake("handshake response missing clientId"))
            },
            _ => Err(self.abort_handshake(response.failure_reason())),
        }
    }

    /// Return to `Unauthenticated` after a failed handshake
    pub fn abort_handshake(&mut self, reason: impl Into<String>) -> RealtimeError {
        if self.state == SessionState::Handshaking {
            self.state = SessionState::Unauthenticated;
        }
        RealtimeError::Handshake(reason.into())
    }

    /// Build a subscribe request
    pub fn subscribe_request(&self, id: &str, channel: &str) -> Result<Request> {
        let client_id = self.authenticated_client_id()?;
        Ok(Request::subscribe(id, client_id, channel))
    }

    /// Apply a subscribe response
    pub fn complete_subscribe(&mut self, channel: &str, response: &Response) -> Result<()> {
        if !response.is_successful() {
            return Err(RealtimeError::Subscription {
                channel: channel.to_string(),
                reason: response.failure_reason(),
            });
        }
        self.subscriptions.insert(channel.to_string());
        Ok(())
    }

    /// Build an unsubscribe request
    pub fn unsubscribe_request(&self, id: &str, channel: &str) -> Result<Request> {
        let client_id = self.authenticated_client_id()?;
        Ok(Request::unsubscribe(id, client_id, channel))
    }

    /// Drop a channel from the local subscription set.
    ///
    /// Happens whatever the server answers to the unsubscribe.
    pub fn forget_subscription(&mut self, channel: &str) -> bool {
        self.subscriptions.remove(channel)
    }

    /// Apply an unsubscribe response
    pub fn complete_unsubscribe(&self, channel: &str, response: &Response) -> Result<()> {
        if response.is_successful() {
            Ok(())
        } else {
            Err(RealtimeError::Subscription {
                channel: channel.to_string(),
                reason: response.failure_reason(),
            })
        }
    }

    /// Build a connect request
    pub fn connect_request(&self, id: &str) -> Result<Request> {
        let client_id = self.authenticated_client_id()?;
        Ok(Request::connect(id, client_id, self.ext(), self.advice))
    }

    /// Apply a connect response.
    ///
    /// Returns the effective advice after merging.
    pub fn complete_connect(&mut self, response: &Response) -> Advice {
        if let Some(advice) = &response.advice {
            self.advice.merge(advice);
        }
        self.advice
    }

    /// Build a disconnect request, if there is a session to disconnect
    pub fn disconnect_request(&self, id: &str) -> Option<Request> {
        self.authenticated_client_id()
            .ok()
            .map(|client_id| Request::disconnect(id, client_id))
    }

    /// Enter `Stopped`. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.state == SessionState::Stopped {
            return false;
        }
        self.state = SessionState::Stopped;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reconnect;

    fn session() -> Session {
        Session::new(
            &Credentials::new("t1", "alice", "pw"),
            &ClientConfig::default(),
        )
    }

    fn handshake_ok(client_id: &str) -> Response {
        Response {
            channel: "/meta/handshake".into(),
            client_id: Some(client_id.into()),
            successful: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn test_session_handshake() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Unauthenticated);

        let request = session.begin_handshake("1").unwrap();
        assert_eq!(request.channel, "/meta/handshake");
        assert_eq!(session.state(), SessionState::Handshaking);

        session.complete_handshake(&handshake_ok("c1")).unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(session.client_id(), Some("c1"));
    }

    #[test]
    fn test_session_handshake_rejected() {
        let mut session = session();
        session.begin_handshake("1").unwrap();

        let reject = Response {
            channel: "/meta/handshake".into(),
            successful: Some(false),
            error: Some("401::Unauthorized".into()),
            ..Default::default()
        };
        let err = session.complete_handshake(&reject).unwrap_err();
        assert!(matches!(err, RealtimeError::Handshake(ref r) if r == "401::Unauthorized"));
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.client_id().is_none());
    }

    #[test]
    fn test_session_handshake_missing_client_id() {
        let mut session = session();
        session.begin_handshake("1").unwrap();
        let response = Response {
            successful: Some(true),
            ..Default::default()
        };
        assert!(session.complete_handshake(&response).is_err());
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_double_handshake_rejected() {
        let mut session = session();
        session.begin_handshake("1").unwrap();
        assert!(matches!(
            session.begin_handshake("2"),
            Err(RealtimeError::Handshake(_))
        ));
    }

    #[test]
    fn test_subscribe_requires_authentication() {
        let session = session();
        assert!(matches!(
            session.subscribe_request("1", "/operations/42"),
            Err(RealtimeError::NotAuthenticated)
        ));
        assert!(session.connect_request("1").is_err());
        assert!(session.disconnect_request("1").is_none());
    }

    #[test]
    fn test_subscription_bookkeeping() {
        let mut session = session();
        session.begin_handshake("1").unwrap();
        session.complete_handshake(&handshake_ok("c1")).unwrap();

        let request = session.subscribe_request("2", "/operations/42").unwrap();
        assert_eq!(request.client_id.as_deref(), Some("c1"));

        let ok = Response {
            successful: Some(true),
            ..Default::default()
        };
        session.complete_subscribe("/operations/42", &ok).unwrap();
        assert!(session.is_subscribed("/operations/42"));

        let denied = Response {
            successful: Some(false),
            error: Some("403::Forbidden".into()),
            ..Default::default()
        };
        assert!(matches!(
            session.complete_subscribe("/alarms/1", &denied),
            Err(RealtimeError::Subscription { .. })
        ));
        assert!(!session.is_subscribed("/alarms/1"));

        // Removal is local and independent of the server's answer
        assert!(session.forget_subscription("/operations/42"));
        assert!(session
            .complete_unsubscribe("/operations/42", &denied)
            .is_err());
        assert!(session.subscriptions().is_empty());
    }

    #[test]
    fn test_server_advice_drives_poll_wait() {
        let mut session = session();
        session.begin_handshake("1").unwrap();
        let mut response = handshake_ok("c1");
        response.advice = Some(Advice {
            timeout: Some(2_000),
            interval: None,
            reconnect: Some(Reconnect::Retry),
        });
        session.complete_handshake(&response).unwrap();

        assert_eq!(
            session.poll_wait(Duration::from_millis(500)),
            Duration::from_millis(2_500)
        );

        let connect = Response {
            advice: Some(Advice {
                reconnect: Some(Reconnect::None),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(session.complete_connect(&connect).forbids_reconnect());
    }

    #[test]
    fn test_stop_is_terminal() {
        let mut session = session();
        assert!(session.stop());
        assert!(!session.stop());
        assert!(matches!(
            session.begin_handshake("1"),
            Err(RealtimeError::SessionStopped)
        ));
        assert!(matches!(
            session.subscribe_request("2", "/x"),
            Err(RealtimeError::SessionStopped)
        ));
    }
}
