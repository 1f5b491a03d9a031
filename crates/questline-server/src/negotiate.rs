//! Client access URL minting.
//!
//! A [`Negotiator`] holds the parsed connection string and signs short-lived
//! HS256 tokens with the access key. Clients receive a URL of the form
//! `ws(s)://host[:port]/client/hubs/<hub>?access_token=<jwt>`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;

use questline_core::{AccessToken, CredentialError, CredentialSource, UserId};
use questline_settings::PubSubSettings;

use crate::error::NegotiateError;

/// Roles granted to every client token.
pub const CLIENT_ROLES: [&str; 2] = ["webpubsub.joinLeaveGroup", "webpubsub.sendToGroup"];

/// Parsed `Endpoint=...;AccessKey=...;Version=1.0;[Port=...]`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// `http(s)://host`, without trailing slash.
    pub endpoint: String,
    /// HMAC signing key.
    pub access_key: String,
    /// Optional explicit port.
    pub port: Option<u16>,
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("access_key", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

impl FromStr for ConnectionString {
    type Err = NegotiateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let cleaned = raw.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        let mut endpoint = None;
        let mut access_key = None;
        let mut port = None;

        for pair in cleaned.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim_end_matches('/').to_string()),
                "accesskey" => access_key = Some(value.to_string()),
                "port" => {
                    port = Some(
                        value
                            .parse::<u16>()
                            .map_err(|_| NegotiateError::InvalidPort(value.to_string()))?,
                    );
                }
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or(NegotiateError::MissingField("Endpoint"))?;
        if !(endpoint.starts_with("https://") || endpoint.starts_with("http://")) {
            return Err(NegotiateError::InvalidEndpoint(endpoint));
        }
        let access_key = access_key
            .filter(|k| !k.is_empty())
            .ok_or(NegotiateError::MissingField("AccessKey"))?;

        Ok(Self {
            endpoint,
            access_key,
            port,
        })
    }
}

impl ConnectionString {
    /// Endpoint with the explicit port appended, when one is configured.
    fn endpoint_with_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.endpoint),
            None => self.endpoint.clone(),
        }
    }
}

#[derive(Serialize)]
struct ClientClaims<'a> {
    aud: String,
    iat: i64,
    exp: i64,
    role: [&'a str; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
}

/// Mints client access URLs for one hub.
#[derive(Debug, Clone)]
pub struct Negotiator {
    connection: ConnectionString,
    hub: String,
    token_lifetime: Duration,
}

impl Negotiator {
    /// Create a negotiator for `hub`.
    pub fn new(connection: ConnectionString, hub: impl Into<String>, token_lifetime: Duration) -> Self {
        Self {
            connection,
            hub: hub.into(),
            token_lifetime,
        }
    }

    /// Build from the `pubsub` settings section.
    pub fn from_settings(settings: &PubSubSettings) -> Result<Self, NegotiateError> {
        let raw = settings
            .require_connection_string()
            .map_err(|_| NegotiateError::NotConfigured)?;
        Ok(Self::new(
            raw.parse()?,
            settings.hub_name.clone(),
            Duration::from_millis(settings.token_lifetime_ms),
        ))
    }

    /// Hub name.
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Token audience: `<endpoint>/client/hubs/<hub>`.
    pub fn audience(&self) -> String {
        format!("{}/client/hubs/{}", self.connection.endpoint_with_port(), self.hub)
    }

    /// Client URL without the token.
    pub fn client_url(&self) -> String {
        let base = self.connection.endpoint_with_port();
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            format!("ws://{}", base.trim_start_matches("http://"))
        };
        format!("{ws}/client/hubs/{}", self.hub)
    }

    /// Mint a client access URL, optionally bound to `user`.
    pub fn client_access_url(&self, user: Option<&UserId>) -> Result<String, NegotiateError> {
        let now = Utc::now().timestamp();
        let lifetime = i64::try_from(self.token_lifetime.as_secs()).unwrap_or(i64::MAX);
        let claims = ClientClaims {
            aud: self.audience(),
            iat: now,
            exp: now.saturating_add(lifetime),
            role: CLIENT_ROLES,
            sub: user.map(UserId::as_str),
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.connection.access_key.as_bytes()),
        )?;
        Ok(format!("{}?access_token={token}", self.client_url()))
    }
}

/// [`CredentialSource`] that mints URLs in-process, for server-side clients.
pub struct NegotiatorCredentialSource {
    negotiator: Arc<Negotiator>,
    user: UserId,
}

impl NegotiatorCredentialSource {
    /// Mint tokens for `user`.
    pub fn new(negotiator: Arc<Negotiator>, user: UserId) -> Self {
        Self { negotiator, user }
    }
}

#[async_trait]
impl CredentialSource for NegotiatorCredentialSource {
    async fn fetch(&self) -> Result<AccessToken, CredentialError> {
        self.negotiator
            .client_access_url(Some(&self.user))
            .map(AccessToken::new)
            .map_err(|e| CredentialError::Mint(e.to_string()))
    }
}
