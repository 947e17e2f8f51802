//! HTTP Probe Client
//!
//! Timed JSON requests against plex.tv and media servers. Nothing here
//! returns `Err`: transport failures, bad statuses and unparsable bodies
//! all come back as an `HttpOutcome` with `error` set.

use reqwest::header::HeaderMap;
use reqwest::{redirect, Client, Method};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

use crate::config::{Timeouts, LIVENESS_TIMEOUTS, PROVIDER_TIMEOUTS};

/// Which timeout class a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// plex.tv API calls
    Provider,
    /// Media server liveness probes
    Liveness,
}

/// Outcome of a single request
#[derive(Debug, Clone, Default)]
pub struct HttpOutcome {
    /// Parsed body, when the body was non-empty valid JSON
    pub json: Option<Value>,
    /// HTTP status, 0 when no response was received
    pub status: u16,
    /// Transport, status or parse failure
    pub error: Option<String>,
    /// Raw response body
    pub raw: String,
}

impl HttpOutcome {
    /// No error and a status in [100, 400)
    pub fn ok(&self) -> bool {
        self.error.is_none() && (100..400).contains(&self.status)
    }

    /// True when the request never produced an HTTP response
    pub fn is_transport_failure(&self) -> bool {
        self.status == 0
    }

    /// First 300 characters of the body, for diagnostics
    pub fn raw_preview(&self) -> String {
        self.raw.chars().take(300).collect()
    }

    fn failed(status: u16, error: String, raw: String) -> Self {
        Self {
            json: None,
            status,
            error: Some(error),
            raw,
        }
    }
}

/// A pair of clients for one timeout class, with and without TLS verification
#[derive(Debug, Clone)]
struct ClientPair {
    verified: Client,
    unverified: Client,
}

impl ClientPair {
    fn new(timeouts: Timeouts) -> reqwest::Result<Self> {
        Ok(Self {
            verified: build_client(timeouts, true)?,
            unverified: build_client(timeouts, false)?,
        })
    }
}

fn build_client(timeouts: Timeouts, verify_tls: bool) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("plex-resolver/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.total)
        // Bind to the IPv4 wildcard so only A records are dialed
        .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .redirect(redirect::Policy::none())
        .danger_accept_invalid_certs(!verify_tls)
        .build()
}

/// JSON HTTP client used by the provider client and the identity prober
#[derive(Debug, Clone)]
pub struct ProbeClient {
    provider: ClientPair,
    liveness: ClientPair,
}

impl ProbeClient {
    pub fn new() -> reqwest::Result<Self> {
        Ok(Self {
            provider: ClientPair::new(PROVIDER_TIMEOUTS)?,
            liveness: ClientPair::new(LIVENESS_TIMEOUTS)?,
        })
    }

    fn client_for(&self, profile: Profile, url: &str, verify_tls: bool) -> &Client {
        let pair = match profile {
            Profile::Provider => &self.provider,
            Profile::Liveness => &self.liveness,
        };
        // The verify flag only matters for https; plain http always uses the strict client
        if is_secure(url) && !verify_tls {
            &pair.unverified
        } else {
            &pair.verified
        }
    }

    /// Issue a request and collect status, body and parsed JSON
    ///
    /// `form` is sent as an urlencoded body when present.
    pub async fn request(
        &self,
        profile: Profile,
        method: Method,
        url: &str,
        headers: HeaderMap,
        form: Option<&[(&str, &str)]>,
        verify_tls: bool,
    ) -> HttpOutcome {
        debug!(%method, %url, ?profile, verify_tls, "HTTP request");

        let mut builder = self
            .client_for(profile, url, verify_tls)
            .request(method, url)
            .headers(headers);
        if let Some(form) = form {
            builder = builder.form(form);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = if e.is_timeout() {
                    format!("timed out: {}", e)
                } else if e.is_connect() {
                    format!("connect failed: {}", e)
                } else {
                    e.to_string()
                };
                debug!(%url, error = %error, "HTTP transport failure");
                return HttpOutcome::failed(0, error, String::new());
            }
        };

        let status = response.status().as_u16();
        let raw = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return HttpOutcome::failed(status, format!("failed reading body: {}", e), String::new())
            }
        };

        if !(100..400).contains(&status) {
            return HttpOutcome::failed(status, format!("HTTP {}", status), raw);
        }

        if raw.trim().is_empty() {
            return HttpOutcome {
                json: None,
                status,
                error: None,
                raw,
            };
        }

        match serde_json::from_str::<Value>(&raw) {
            Ok(json) => HttpOutcome {
                json: Some(json),
                status,
                error: None,
                raw,
            },
            Err(e) => HttpOutcome::failed(status, format!("invalid JSON body: {}", e), raw),
        }
    }
}

fn is_secure(url: &str) -> bool {
    url.get(..8)
        .map(|scheme| scheme.eq_ignore_ascii_case("https://"))
        .unwrap_or(false)
}
