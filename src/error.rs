//! Resolution Errors
//!
//! Failure taxonomy surfaced by the top-level engine operations.

use thiserror::Error;

use crate::prober::ProbeResult;

/// Errors that can abort a start/poll/save operation
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Transport failure talking to plex.tv
    #[error("plex.tv unreachable: {0}")]
    ProviderUnreachable(String),

    /// plex.tv answered with a non-success status or an unusable body
    #[error("plex.tv rejected the request: {0}")]
    ProviderRejected(String),

    /// The presented PIN id was not issued by this session
    #[error("Invalid or unknown PIN id")]
    UnknownExchange,

    /// PIN approved but the resource list could not be fetched
    #[error("Token ok, but resource discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Save called before the PIN exchange produced a credential
    #[error("Sign-in has not completed for this session")]
    ExchangeNotReady,

    /// Every (url, token) pair failed its identity probe
    #[error("Could not reach Plex with any candidate token/url")]
    NoWorkingCombination { probes: Vec<ProbeResult> },

    /// Config store write failed
    #[error("Failed writing configuration: {0}")]
    PersistFailed(#[from] StoreError),

    /// Malformed caller input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ResolveError {
    /// Stable machine-readable code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::ProviderUnreachable(_) => "provider_unreachable",
            ResolveError::ProviderRejected(_) => "provider_rejected",
            ResolveError::UnknownExchange => "unknown_exchange",
            ResolveError::DiscoveryFailed(_) => "discovery_failed",
            ResolveError::ExchangeNotReady => "exchange_not_ready",
            ResolveError::NoWorkingCombination { .. } => "no_working_combination",
            ResolveError::PersistFailed(_) => "persist_failed",
            ResolveError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// HTTP status used by the API surface
    pub fn status_code(&self) -> u16 {
        match self {
            ResolveError::ProviderUnreachable(_)
            | ResolveError::ProviderRejected(_)
            | ResolveError::DiscoveryFailed(_) => 502,
            ResolveError::UnknownExchange => 404,
            ResolveError::ExchangeNotReady => 409,
            ResolveError::NoWorkingCombination { .. } => 422,
            ResolveError::PersistFailed(_) => 500,
            ResolveError::InvalidRequest(_) => 400,
        }
    }

    /// Probe matrix attached to the failure, if any
    pub fn probes(&self) -> Option<&[ProbeResult]> {
        match self {
            ResolveError::NoWorkingCombination { probes } => Some(probes),
            _ => None,
        }
    }
}

/// Errors from the persistent config store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed value for {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type Result<T, E = ResolveError> = std::result::Result<T, E>;
