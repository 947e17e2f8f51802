//! plex.tv API Client
//!
//! PIN creation, PIN polling and resource discovery. Responses are parsed
//! into optional-field structures; a missing key becomes `None` rather
//! than a parse failure.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::candidates::{RemoteConnection, RemoteResource};
use crate::config::ClientIdentity;
use crate::error::{ResolveError, Result};
use crate::http::{HttpOutcome, Profile, ProbeClient};
use crate::token::AccessToken;

const RESOURCES_QUERY: &str = "includeHttps=1&includeRelay=1&includeIPv6=1&includeTokens=1";

/// Header carrying a Plex token
pub const TOKEN_HEADER: &str = "X-Plex-Token";

/// Audit-safe summary of one plex.tv call
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CallSummary {
    pub code: u16,
    pub error: Option<String>,
    pub json_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_preview: Option<String>,
}

impl CallSummary {
    fn from_outcome(outcome: &HttpOutcome, with_preview: bool) -> Self {
        Self {
            code: outcome.status,
            error: outcome.error.clone(),
            json_fields: outcome
                .json
                .as_ref()
                .and_then(Value::as_object)
                .map(|o| o.keys().cloned().collect()),
            raw_preview: with_preview.then(|| outcome.raw_preview()),
        }
    }
}

/// A freshly created PIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinGrant {
    pub id: u64,
    pub code: String,
    pub expires_at: Option<String>,
}

/// State of a PIN on plex.tv
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinStatus {
    /// Not yet approved by the user
    Pending,
    /// Approved; carries the account token
    Authorized(AccessToken),
}

// ============================================================
// API Response Types
// ============================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    client_identifier: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    provides: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    connections: Option<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionResponse {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    local: Option<bool>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    https: Option<bool>,
}

impl ConnectionResponse {
    /// Connections without a uri are dropped
    fn into_connection(self) -> Option<RemoteConnection> {
        let uri = self.uri.filter(|u| !u.is_empty())?;
        let is_secure = self
            .protocol
            .as_deref()
            .map(|p| p.eq_ignore_ascii_case("https"))
            .unwrap_or(false)
            || self.https.unwrap_or(false);
        Some(RemoteConnection {
            uri,
            is_local: self.local.unwrap_or(false),
            is_secure,
        })
    }
}

impl From<ResourceResponse> for RemoteResource {
    fn from(r: ResourceResponse) -> Self {
        let connections = r
            .connections
            .unwrap_or_default()
            .into_iter()
            .filter_map(|c| serde_json::from_value::<ConnectionResponse>(c).ok())
            .filter_map(ConnectionResponse::into_connection)
            .collect();

        RemoteResource {
            name: r.name,
            stable_id: r.client_identifier.filter(|id| !id.is_empty()),
            access_token: r.access_token.and_then(AccessToken::new),
            provides: r.provides,
            product: r.product,
            connections,
        }
    }
}

/// Parse a resource list, skipping entries that are not objects
pub fn parse_resources(json: &Value) -> Option<Vec<RemoteResource>> {
    let items = json.as_array()?;
    Some(
        items
            .iter()
            .filter(|item| item.is_object())
            .filter_map(|item| serde_json::from_value::<ResourceResponse>(item.clone()).ok())
            .map(RemoteResource::from)
            .collect(),
    )
}

// ============================================================
// Client Implementation
// ============================================================

/// plex.tv client bound to one product identity
#[derive(Debug, Clone)]
pub struct PlexTvClient {
    http: ProbeClient,
    base_url: String,
    auth_app_url: String,
    identity: ClientIdentity,
}

impl PlexTvClient {
    pub fn new(
        http: ProbeClient,
        base_url: &str,
        auth_app_url: &str,
        identity: ClientIdentity,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_app_url: auth_app_url.to_string(),
            identity,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Standard `X-Plex-*` headers, plus the token header when given
    pub fn headers(&self, client_id: &str, token: Option<&AccessToken>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let fields = [
            ("x-plex-product", self.identity.product.as_str()),
            ("x-plex-version", self.identity.version.as_str()),
            ("x-plex-client-identifier", client_id),
            ("x-plex-device", self.identity.device.as_str()),
            ("x-plex-platform", self.identity.platform.as_str()),
        ];
        for (name, value) in fields {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.insert(HeaderName::from_static(name), v);
                }
                Err(_) => warn!(header = name, "Skipping header with invalid characters"),
            }
        }

        if let Some(token) = token {
            if let Ok(v) = HeaderValue::from_str(token.expose()) {
                headers.insert(HeaderName::from_static("x-plex-token"), v);
            }
        }
        headers
    }

    /// Browser link that lets the user approve a PIN
    pub fn deeplink(&self, client_id: &str, code: &str) -> String {
        let params = [
            ("clientID", client_id),
            ("code", code),
            ("context[device][product]", self.identity.product.as_str()),
            ("context[device][version]", self.identity.version.as_str()),
            ("context[device][platform]", self.identity.platform.as_str()),
        ];
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect();
        format!("{}#?{}", self.auth_app_url, query.join("&"))
    }

    /// Create a strong PIN
    pub async fn create_pin(&self, client_id: &str) -> (CallSummary, Result<PinGrant>) {
        let url = format!("{}/api/v2/pins?strong=true", self.base_url);
        let outcome = self
            .http
            .request(
                Profile::Provider,
                Method::POST,
                &url,
                self.headers(client_id, None),
                Some(&[]),
                true,
            )
            .await;
        let summary = CallSummary::from_outcome(&outcome, true);

        let result = exchange_body(&outcome).and_then(|json| {
            let pin: PinResponse = serde_json::from_value(json.clone()).unwrap_or_default();
            match pin.id.filter(|id| *id > 0) {
                Some(id) => Ok(PinGrant {
                    id,
                    code: pin.code.unwrap_or_default(),
                    expires_at: pin.expires_at,
                }),
                None => Err(ResolveError::ProviderRejected(
                    "PIN response carried no id".to_string(),
                )),
            }
        });

        if let Ok(pin) = &result {
            info!(pin_id = pin.id, "PIN created");
        }
        (summary, result)
    }

    /// Check whether a PIN has been approved
    pub async fn check_pin(&self, client_id: &str, pin_id: u64) -> (CallSummary, Result<PinStatus>) {
        let url = format!("{}/api/v2/pins/{}", self.base_url, pin_id);
        let outcome = self
            .http
            .request(
                Profile::Provider,
                Method::GET,
                &url,
                self.headers(client_id, None),
                None,
                true,
            )
            .await;
        // An approved PIN body holds the account token: never preview it
        let summary = CallSummary::from_outcome(&outcome, false);

        let result = exchange_body(&outcome).map(|json| {
            let pin: PinResponse = serde_json::from_value(json.clone()).unwrap_or_default();
            match pin.auth_token.and_then(AccessToken::new) {
                Some(token) => PinStatus::Authorized(token),
                None => PinStatus::Pending,
            }
        });

        debug!(pin_id, status = outcome.status, "PIN polled");
        (summary, result)
    }

    /// List resources visible to the account token
    pub async fn discover_resources(
        &self,
        client_id: &str,
        token: &AccessToken,
    ) -> (CallSummary, Result<Vec<RemoteResource>>) {
        let url = format!("{}/api/v2/resources?{}", self.base_url, RESOURCES_QUERY);
        let outcome = self
            .http
            .request(
                Profile::Provider,
                Method::GET,
                &url,
                self.headers(client_id, Some(token)),
                None,
                true,
            )
            .await;
        let summary = CallSummary::from_outcome(&outcome, false);

        let result = if !outcome.ok() {
            Err(ResolveError::DiscoveryFailed(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("HTTP {}", outcome.status)),
            ))
        } else {
            outcome
                .json
                .as_ref()
                .and_then(parse_resources)
                .ok_or_else(|| {
                    ResolveError::DiscoveryFailed("resource list was not an array".to_string())
                })
        };

        if let Ok(resources) = &result {
            info!(count = resources.len(), "Discovered plex.tv resources");
        }
        (summary, result)
    }
}

/// Map a PIN endpoint outcome to its JSON body or a provider error
fn exchange_body(outcome: &HttpOutcome) -> Result<&Value> {
    if outcome.is_transport_failure() {
        return Err(ResolveError::ProviderUnreachable(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "no response".to_string()),
        ));
    }
    if !outcome.ok() {
        return Err(ResolveError::ProviderRejected(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("HTTP {}", outcome.status)),
        ));
    }
    outcome
        .json
        .as_ref()
        .filter(|json| json.is_object())
        .ok_or_else(|| ResolveError::ProviderRejected(format!("HTTP {}: empty body", outcome.status)))
}
