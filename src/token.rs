//! Access Tokens
//!
//! Plex tokens are secrets. The wrapper here never prints or serializes
//! the full value; only a fixed 6-character preview leaves the process
//! outside of the config store and the `X-Plex-Token` header.

use serde::{Deserialize, Serialize};

const PREVIEW_LEN: usize = 6;

/// A Plex token (server access token or account token)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token, rejecting empty or whitespace-only input
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Full token; only for headers and the config store
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First six characters followed by an ellipsis
    pub fn preview(&self) -> String {
        preview(&self.0)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessToken({})", self.preview())
    }
}

/// Preview of an arbitrary secret string
pub fn preview(secret: &str) -> String {
    let head: String = secret.chars().take(PREVIEW_LEN).collect();
    format!("{}...", head)
}

/// Where a candidate token came from, in trust order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenSource {
    /// `accessToken` on the discovered resource
    ResourceLevel,
    /// `X-Plex-Token` query parameter on the connection uri
    UriEmbedded,
    /// Account token returned by the PIN exchange
    ExchangeFallback,
}

impl std::fmt::Display for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::ResourceLevel => write!(f, "resource-level"),
            TokenSource::UriEmbedded => write!(f, "uri-embedded"),
            TokenSource::ExchangeFallback => write!(f, "exchange-fallback"),
        }
    }
}

/// A token tagged with its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedToken {
    pub token: AccessToken,
    pub source: TokenSource,
}

/// Redacted view of a `SourcedToken` for API responses and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenView {
    pub preview: String,
    pub source: TokenSource,
}

impl From<&SourcedToken> for TokenView {
    fn from(t: &SourcedToken) -> Self {
        Self {
            preview: t.token.preview(),
            source: t.source,
        }
    }
}
