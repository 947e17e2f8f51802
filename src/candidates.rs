//! Candidate Builder
//!
//! Turns the plex.tv resource list into de-duplicated candidate servers,
//! each carrying its tokens in trust order:
//!
//! 1. the resource's own `accessToken`
//! 2. an `X-Plex-Token` embedded in the connection uri
//! 3. the account token from the PIN exchange
//!
//! Output order follows input order, so identical inputs always produce
//! identical candidate lists.

use reqwest::Url;
use serde::Serialize;
use std::collections::HashSet;

use crate::config::PLEX_DEFAULT_PORT;
use crate::token::{AccessToken, SourcedToken, TokenSource, TokenView};

/// A service entry from plex.tv discovery
#[derive(Debug, Clone, Default)]
pub struct RemoteResource {
    pub name: Option<String>,
    pub stable_id: Option<String>,
    pub access_token: Option<AccessToken>,
    pub provides: Option<String>,
    pub product: Option<String>,
    pub connections: Vec<RemoteConnection>,
}

/// One network path to a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub uri: String,
    pub is_local: bool,
    pub is_secure: bool,
}

/// A server endpoint with its ranked tokens, not yet verified
#[derive(Debug, Clone)]
pub struct CandidateServer {
    pub name: String,
    pub stable_id: Option<String>,
    pub uri: String,
    pub is_local: bool,
    pub is_secure: bool,
    pub tokens: Vec<SourcedToken>,
}

/// Redacted candidate for API responses and the audit log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub id: Option<String>,
    pub uri: String,
    pub local: bool,
    pub https: bool,
    pub tokens: Vec<TokenView>,
}

impl CandidateServer {
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            name: self.name.clone(),
            id: self.stable_id.clone(),
            uri: self.uri.clone(),
            local: self.is_local,
            https: self.is_secure,
            tokens: self.tokens.iter().map(TokenView::from).collect(),
        }
    }

    fn synthetic(name: &str, uri: String, fallback: Option<&AccessToken>) -> Self {
        Self {
            name: name.to_string(),
            stable_id: None,
            uri,
            is_local: true,
            is_secure: false,
            tokens: fallback
                .map(|t| SourcedToken {
                    token: t.clone(),
                    source: TokenSource::ExchangeFallback,
                })
                .into_iter()
                .collect(),
        }
    }
}

/// True when the resource advertises Plex Media Server capability
pub fn is_server_resource(resource: &RemoteResource) -> bool {
    let provides = resource.provides.as_deref().unwrap_or("").to_lowercase();
    if provides.contains("server") {
        return true;
    }
    resource
        .product
        .as_deref()
        .unwrap_or("")
        .to_lowercase()
        .contains("plex media server")
}

/// Token carried in the uri's `X-Plex-Token` query parameter
pub fn token_from_uri(uri: &str) -> Option<AccessToken> {
    let url = Url::parse(uri).ok()?;
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    ["X-Plex-Token", "x-plex-token"].iter().find_map(|key| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| AccessToken::new(v.clone()))
    })
}

/// The uri with any `X-Plex-Token` query parameter removed
pub fn strip_token_param(uri: &str) -> String {
    let trimmed = uri.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    if url.query().is_none() {
        return trimmed.to_string();
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("x-plex-token"))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let out = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        out.trim_end_matches('/').to_string()
    } else {
        out
    }
}

/// De-duplication key: trailing slash stripped, host lowercased
pub fn normalize_uri(uri: &str) -> String {
    let trimmed = uri.trim().trim_end_matches('/');
    let Ok(url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    let Some(host) = url.host_str() else {
        return trimmed.to_string();
    };

    let mut key = format!("{}://{}", url.scheme(), host.to_lowercase());
    if let Some(port) = url.port() {
        key.push_str(&format!(":{}", port));
    }
    key.push_str(url.path().trim_end_matches('/'));
    if let Some(query) = url.query() {
        key.push('?');
        key.push_str(query);
    }
    key
}

fn push_unique(tokens: &mut Vec<SourcedToken>, token: Option<AccessToken>, source: TokenSource) {
    if let Some(token) = token {
        if !tokens.iter().any(|t| t.token == token) {
            tokens.push(SourcedToken { token, source });
        }
    }
}

/// Build the ranked candidate list
///
/// Falls back to a loopback and a bridge-host entry when nothing usable
/// was discovered, so local setups still get a probe.
pub fn build_candidates(
    resources: &[RemoteResource],
    fallback: Option<&AccessToken>,
    bridge_host: &str,
) -> Vec<CandidateServer> {
    let mut seen = HashSet::new();
    let mut servers = Vec::new();

    for resource in resources.iter().filter(|r| is_server_resource(r)) {
        let name = resource.name.clone().unwrap_or_else(|| "Server".to_string());

        for conn in resource.connections.iter().filter(|c| !c.uri.is_empty()) {
            let mut tokens = Vec::new();
            push_unique(&mut tokens, resource.access_token.clone(), TokenSource::ResourceLevel);
            push_unique(&mut tokens, token_from_uri(&conn.uri), TokenSource::UriEmbedded);
            push_unique(&mut tokens, fallback.cloned(), TokenSource::ExchangeFallback);

            // Uris differing only by an embedded token are the same endpoint
            let uri = strip_token_param(&conn.uri);
            if !seen.insert(normalize_uri(&uri)) {
                continue;
            }

            servers.push(CandidateServer {
                name: name.clone(),
                stable_id: resource.stable_id.clone(),
                uri,
                is_local: conn.is_local,
                is_secure: conn.is_secure,
                tokens,
            });
        }
    }

    if servers.is_empty() {
        servers.push(CandidateServer::synthetic(
            "Localhost (same machine)",
            format!("http://localhost:{}", PLEX_DEFAULT_PORT),
            fallback,
        ));
        servers.push(CandidateServer::synthetic(
            &format!("Docker host ({})", bridge_host),
            format!("http://{}:{}", bridge_host, PLEX_DEFAULT_PORT),
            fallback,
        ));
    }

    servers
}

/// Port written in the url's authority, including scheme defaults like `:80`
///
/// `Url::port` hides a port equal to the scheme default, which would lose
/// an explicit `http://localhost:80` on remap.
fn explicit_port(url: &str) -> Option<u16> {
    let rest = url.trim().split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    if host_port.ends_with(']') {
        return None;
    }
    host_port.rsplit_once(':')?.1.parse().ok()
}

/// Rewrite a loopback url to the container bridge host
///
/// Returns `None` when the host is not `localhost`/`127.0.0.1`. Scheme,
/// port, path and query are kept; a missing port becomes 443 for https,
/// else 32400.
pub fn remap_loopback(url: &str, bridge_host: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    if host != "localhost" && host != "127.0.0.1" {
        return None;
    }

    let scheme = parsed.scheme();
    let port = explicit_port(url).or(parsed.port()).unwrap_or(if scheme == "https" {
        443
    } else {
        PLEX_DEFAULT_PORT
    });

    let mut out = format!("{}://{}:{}", scheme, bridge_host, port);
    let path = parsed.path().trim_end_matches('/');
    out.push_str(path);
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    Some(out)
}

/// Host and written port, used to match a manual url to a candidate
pub fn host_port(url: &str) -> Option<(String, Option<u16>)> {
    let parsed = Url::parse(url.trim()).ok()?;
    Some((
        parsed.host_str()?.to_lowercase(),
        explicit_port(url).or(parsed.port()),
    ))
}
