//! Access tokens and where they come from.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::CredentialError;

/// A short-lived client access URL.
///
/// The URL embeds the signed token, so it is redacted in `Debug` output.
#[derive(Clone)]
pub struct AccessToken {
    url: String,
    issued_at: DateTime<Utc>,
}

impl AccessToken {
    /// Wrap a freshly obtained client access URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            issued_at: Utc::now(),
        }
    }

    /// The client access URL to open the transport with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// When this token was obtained.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible = self.url.split('?').next().unwrap_or_default();
        f.debug_struct("AccessToken")
            .field("url", &format_args!("{visible}?<redacted>"))
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Supplies a fresh access token for each connection attempt.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Fetch a new token.
    async fn fetch(&self) -> Result<AccessToken, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_query() {
        let token = AccessToken::new("wss://host/client/hubs/quests?access_token=secret");
        let debug = format!("{token:?}");
        assert!(debug.contains("wss://host/client/hubs/quests"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn url_is_returned_verbatim() {
        let token = AccessToken::new("wss://host/x?access_token=t");
        assert_eq!(token.url(), "wss://host/x?access_token=t");
        assert!(token.issued_at() <= Utc::now());
    }
}
