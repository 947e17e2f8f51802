//! Connectivity Check
//!
//! Verifies the persisted credential still works: identity probe, then the
//! library section listing. `diagnose` is the longer form used to debug a
//! url/token pair, with overrides and a token comparison.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::candidates::{remap_loopback, token_from_uri};
use crate::coordinator::Coordinator;
use crate::http::{HttpOutcome, Profile};
use crate::prober::{RemoteIdentity, IDENTITY_PATH};
use crate::store::{load_credential, parse_flag, KEY_TOKEN, KEY_URL, KEY_VERIFY_TLS};
use crate::token::{AccessToken, SourcedToken, TokenSource};

pub const SECTIONS_PATH: &str = "/library/sections";
pub const PREFS_PATH: &str = "/:/prefs";
pub const SESSIONS_PATH: &str = "/status/sessions";

/// One library section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibrarySection {
    pub key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Result of a connectivity check
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub ok: bool,
    pub url: Option<String>,
    pub identity: Option<RemoteIdentity>,
    pub sections: Vec<LibrarySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionReport {
    fn failed(url: Option<String>, error: impl Into<String>) -> Self {
        Self {
            url,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Pull sections out of `MediaContainer.Directory`
pub fn parse_sections(json: &Value) -> Vec<LibrarySection> {
    let directories = json
        .pointer("/MediaContainer/Directory")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let text = |v: &Value, key: &str| match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    directories
        .iter()
        .map(|d| LibrarySection {
            key: text(d, "key"),
            title: text(d, "title"),
            kind: text(d, "type"),
        })
        .collect()
}

impl Coordinator {
    /// Probe the saved server and list its libraries
    pub async fn check_connection(&self) -> ConnectionReport {
        let credential = match load_credential(self.store().as_ref()).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return ConnectionReport::failed(None, "missing_credential"),
            Err(e) => {
                warn!(error = %e, "Reading stored credential failed");
                return ConnectionReport::failed(None, e.to_string());
            }
        };

        let url = remap_loopback(&credential.url, self.bridge_host())
            .unwrap_or_else(|| credential.url.trim_end_matches('/').to_string());

        let token = SourcedToken {
            token: credential.token.clone(),
            source: TokenSource::ResourceLevel,
        };
        let probe = self.prober().probe(&url, &token, credential.verify_tls).await;
        if !probe.ok {
            let error = probe
                .error
                .unwrap_or_else(|| format!("HTTP {}", probe.http_code));
            return ConnectionReport::failed(Some(url), error);
        }

        let outcome = self
            .authed_get(&url, SECTIONS_PATH, &credential.token, credential.verify_tls)
            .await;

        if !outcome.ok() {
            let error = outcome.error.unwrap_or_else(|| "no response".to_string());
            return ConnectionReport {
                identity: probe.identity,
                ..ConnectionReport::failed(Some(url), error)
            };
        }

        let sections = outcome.json.as_ref().map(parse_sections).unwrap_or_default();
        info!(url = %url, sections = sections.len(), "Connection check passed");

        ConnectionReport {
            ok: true,
            url: Some(url),
            identity: probe.identity,
            sections,
            error: None,
        }
    }

    /// GET `{url}{path}` with the token in the `X-Plex-Token` header
    async fn authed_get(
        &self,
        url: &str,
        path: &str,
        token: &AccessToken,
        verify_tls: bool,
    ) -> HttpOutcome {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        match HeaderValue::from_str(token.expose()) {
            Ok(value) => {
                headers.insert(HeaderName::from_static("x-plex-token"), value);
            }
            Err(_) => {
                return HttpOutcome {
                    error: Some("token contains characters not allowed in a header".to_string()),
                    ..Default::default()
                }
            }
        }
        self.http()
            .request(
                Profile::Liveness,
                Method::GET,
                &format!("{}{}", url.trim_end_matches('/'), path),
                headers,
                None,
                verify_tls,
            )
            .await
    }

    /// Exercise a url/token pair against several endpoints
    ///
    /// Overrides in `options` win over the stored values. Endpoint bodies
    /// are never echoed since `/:/prefs` carries the server's own token.
    pub async fn diagnose(&self, options: &DiagnoseOptions) -> DiagnosticReport {
        let stored = match self.store().read_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Reading stored credential failed");
                return DiagnosticReport::failed(e.to_string());
            }
        };
        let stored_value = |key: &str| {
            stored
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let url = non_empty(&options.url).or_else(|| stored_value(KEY_URL));
        let token = non_empty(&options.token)
            .or_else(|| stored_value(KEY_TOKEN))
            .and_then(AccessToken::new);
        let verify_tls = options
            .verify_tls
            .unwrap_or_else(|| stored_value(KEY_VERIFY_TLS).is_some_and(|v| parse_flag(&v)));

        let mut report = DiagnosticReport {
            configured_url: url.clone(),
            url_overridden: non_empty(&options.url).is_some(),
            token_overridden: non_empty(&options.token).is_some(),
            token_preview: token.as_ref().map(AccessToken::preview),
            verify_tls,
            ..Default::default()
        };
        report.comparison = options
            .compare_url
            .as_deref()
            .map(|other| TokenComparison::new(other, token.as_ref()));

        let (Some(url), Some(token)) = (url, token) else {
            report.error = Some("missing_credential".to_string());
            return report;
        };

        let effective = if options.no_remap {
            url.trim_end_matches('/').to_string()
        } else {
            remap_loopback(&url, self.bridge_host())
                .unwrap_or_else(|| url.trim_end_matches('/').to_string())
        };
        report.remapped = effective != url.trim_end_matches('/');

        for path in [IDENTITY_PATH, PREFS_PATH, SESSIONS_PATH, SECTIONS_PATH] {
            let outcome = self.authed_get(&effective, path, &token, verify_tls).await;
            if outcome.ok() {
                match path {
                    IDENTITY_PATH => {
                        report.identity = outcome.json.as_ref().and_then(RemoteIdentity::from_json)
                    }
                    SECTIONS_PATH => {
                        report.sections = outcome.json.as_ref().map(parse_sections).unwrap_or_default()
                    }
                    _ => {}
                }
            }
            report.endpoints.push(EndpointReport {
                path: path.to_string(),
                http_code: outcome.status,
                ok: outcome.ok(),
                error: outcome.error,
            });
        }

        report.ok = report.endpoints.first().map(|e| e.ok).unwrap_or(false);
        info!(
            url = %effective,
            token = %report.token_preview.as_deref().unwrap_or(""),
            reachable = report.ok,
            "Diagnostics finished"
        );
        report.effective_url = Some(effective);
        report
    }
}

// ============================================================
// Diagnostics
// ============================================================

/// Overrides for `diagnose`; `None` falls back to the stored value
#[derive(Debug, Clone, Default)]
pub struct DiagnoseOptions {
    pub url: Option<String>,
    pub token: Option<String>,
    pub verify_tls: Option<bool>,
    /// A url carrying `X-Plex-Token`, compared against the token in use
    pub compare_url: Option<String>,
    pub no_remap: bool,
}

/// Status of one endpoint; the body is not kept
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointReport {
    pub path: String,
    pub http_code: u16,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Token found in a compare url versus the token in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenComparison {
    pub present: bool,
    pub preview: Option<String>,
    /// `None` when either side has no token
    pub matches: Option<bool>,
}

impl TokenComparison {
    pub fn new(compare_url: &str, in_use: Option<&AccessToken>) -> Self {
        let found = token_from_uri(compare_url);
        Self {
            present: found.is_some(),
            preview: found.as_ref().map(AccessToken::preview),
            matches: found
                .as_ref()
                .zip(in_use)
                .map(|(a, b)| a.expose() == b.expose()),
        }
    }
}

/// Result of `diagnose`; `ok` tracks the `/identity` endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub configured_url: Option<String>,
    pub effective_url: Option<String>,
    pub remapped: bool,
    pub url_overridden: bool,
    pub token_overridden: bool,
    pub token_preview: Option<String>,
    pub verify_tls: bool,
    pub endpoints: Vec<EndpointReport>,
    pub identity: Option<RemoteIdentity>,
    pub sections: Vec<LibrarySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<TokenComparison>,
}

impl DiagnosticReport {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
