//! Identity Prober
//!
//! Authenticated liveness check against a media server's `/identity`
//! endpoint. The token travels in the `X-Plex-Token` header only, never
//! in the query string.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::http::{Profile, ProbeClient};
use crate::token::{SourcedToken, TokenSource};

/// Liveness path appended to the base url
pub const IDENTITY_PATH: &str = "/identity";

/// Identity reported by a media server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIdentity {
    #[serde(rename = "machineIdentifier")]
    pub stable_id: Option<String>,
    pub version: Option<String>,
    pub device: Option<String>,
    pub platform: Option<String>,
}

impl RemoteIdentity {
    /// Extract identity fields from an object body; absent fields are `None`
    pub fn from_json(json: &Value) -> Option<Self> {
        let obj = json.as_object()?;
        let field = |key: &str| {
            obj.get(key).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        Some(Self {
            stable_id: field("machineIdentifier"),
            version: field("version"),
            device: field("device"),
            platform: field("platform"),
        })
    }
}

/// Outcome of one (url, token) probe; holds only a token preview
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub candidate_url: String,
    pub token_preview: String,
    pub token_source: TokenSource,
    pub http_code: u16,
    pub error: Option<String>,
    pub ok: bool,
    pub identity: Option<RemoteIdentity>,
}

impl ProbeResult {
    /// Identity's machineIdentifier equals `claimed`, ignoring case
    pub fn matches_server(&self, claimed: &str) -> bool {
        self.identity
            .as_ref()
            .and_then(|i| i.stable_id.as_deref())
            .map(|id| id.eq_ignore_ascii_case(claimed))
            .unwrap_or(false)
    }
}

/// Probes media servers through the shared HTTP client
#[derive(Debug, Clone)]
pub struct IdentityProber {
    http: ProbeClient,
}

impl IdentityProber {
    pub fn new(http: ProbeClient) -> Self {
        Self { http }
    }

    /// Probe `{url}/identity` with one token
    pub async fn probe(&self, url: &str, token: &SourcedToken, verify_tls: bool) -> ProbeResult {
        let target = format!("{}{}", url.trim_end_matches('/'), IDENTITY_PATH);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let token_header = HeaderValue::from_str(token.token.expose());

        let outcome = match token_header {
            Ok(value) => {
                headers.insert(HeaderName::from_static("x-plex-token"), value);
                self.http
                    .request(Profile::Liveness, Method::GET, &target, headers, None, verify_tls)
                    .await
            }
            Err(_) => crate::http::HttpOutcome {
                error: Some("token contains characters not allowed in a header".to_string()),
                ..Default::default()
            },
        };

        let result = ProbeResult {
            candidate_url: url.to_string(),
            token_preview: token.token.preview(),
            token_source: token.source,
            http_code: outcome.status,
            error: outcome.error.clone(),
            ok: outcome.ok(),
            identity: outcome.json.as_ref().and_then(RemoteIdentity::from_json),
        };

        debug!(
            url = %result.candidate_url,
            token = %result.token_preview,
            source = %result.token_source,
            code = result.http_code,
            ok = result.ok,
            "Identity probe"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::AccessToken;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sourced(v: &str) -> SourcedToken {
        SourcedToken {
            token: AccessToken::new(v).unwrap(),
            source: TokenSource::ResourceLevel,
        }
    }

    #[test]
    fn test_identity_absent_fields_are_none() {
        let id = RemoteIdentity::from_json(&json!({"machineIdentifier": "abc", "version": 1})).unwrap();
        assert_eq!(id.stable_id.as_deref(), Some("abc"));
        assert_eq!(id.version.as_deref(), Some("1"));
        assert!(id.device.is_none());

        assert!(RemoteIdentity::from_json(&json!(["not", "object"])).is_none());
    }

    #[test]
    fn test_matches_server_case_insensitive() {
        let result = ProbeResult {
            candidate_url: "http://x".into(),
            token_preview: "abc...".into(),
            token_source: TokenSource::ResourceLevel,
            http_code: 200,
            error: None,
            ok: true,
            identity: Some(RemoteIdentity {
                stable_id: Some("ABCdef".into()),
                ..Default::default()
            }),
        };
        assert!(result.matches_server("abcDEF"));
        assert!(!result.matches_server("other"));
    }

    #[tokio::test]
    async fn test_probe_sends_token_in_header_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/identity"))
            .and(header("X-Plex-Token", "good-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "machineIdentifier": "m1",
                "version": "1.40.0"
            })))
            .mount(&server)
            .await;
        Mock::given(query_param("X-Plex-Token", "good-token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let prober = IdentityProber::new(ProbeClient::new().unwrap());
        let result = prober
            .probe(&format!("{}/", server.uri()), &sourced("good-token"), true)
            .await;

        assert!(result.ok);
        assert_eq!(result.http_code, 200);
        assert_eq!(result.token_preview, "good-t...");
        assert_eq!(result.identity.unwrap().stable_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_probe_unauthorized_is_not_ok() {
        let server = MockServer::start().await;
        Mock::given(path("/identity"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let prober = IdentityProber::new(ProbeClient::new().unwrap());
        let result = prober.probe(&server.uri(), &sourced("bad-token"), true).await;

        assert!(!result.ok);
        assert_eq!(result.http_code, 401);
        assert!(result.identity.is_none());
    }

    #[tokio::test]
    async fn test_probe_serialization_has_no_full_token() {
        let prober = IdentityProber::new(ProbeClient::new().unwrap());
        let result = prober
            .probe("http://127.0.0.1:1", &sourced("supersecrettoken"), true)
            .await;

        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("supersecrettoken"));
        assert!(json.contains("\"tokenPreview\":\"supers...\""));
        assert!(!result.ok);
    }
}
