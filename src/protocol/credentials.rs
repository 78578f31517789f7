//! Handshake credentials.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::message::Authn;
use crate::error::{RealtimeError, Result};

/// Tenant login used for the handshake token
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    tenant: String,
    username: String,
    password: String,
    tfa_token: Option<String>,
    xsrf_token: Option<String>,
}

impl Credentials {
    /// Create credentials for `tenant/username`
    pub fn new(tenant: &str, username: &str, password: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            tfa_token: None,
            xsrf_token: None,
        }
    }

    /// Attach a two-factor token
    pub fn with_tfa_token(mut self, token: &str) -> Self {
        self.tfa_token = Some(token.to_string());
        self
    }

    /// Attach an XSRF token
    pub fn with_xsrf_token(mut self, token: &str) -> Self {
        self.xsrf_token = Some(token.to_string());
        self
    }

    /// Tenant id
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Login name
    pub fn username(&self) -> &str {
        &self.username
    }

    /// `base64("tenant/user:password")`
    pub fn token(&self) -> String {
        STANDARD.encode(format!("{}/{}:{}", self.tenant, self.username, self.password))
    }

    /// Extension block for the handshake
    pub fn authn(&self) -> Authn {
        Authn {
            token: self.token(),
            tfa: self.tfa_token.clone(),
            xsrf_token: self.xsrf_token.clone(),
        }
    }

    /// Reject empty fields before anything is sent
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("tenant", &self.tenant),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if value.is_empty() {
                return Err(RealtimeError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant", &self.tenant)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}
