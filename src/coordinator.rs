//! Resolution Coordinator
//!
//! Drives one session from PIN creation to a persisted credential:
//!
//! ```text
//! Idle -> Started -> Polling -> ServersReady -> Saving -> Saved
//!                  \__________________________________/
//!                                 -> Failed
//! ```
//!
//! The caller owns the poll cadence; nothing here sleeps or spawns. The
//! probe matrix is walked sequentially in (url, token) priority order and
//! stops at the first qualifying success.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::candidates::{build_candidates, host_port, remap_loopback, CandidateServer, ServerSummary};
use crate::config::EngineConfig;
use crate::error::{ResolveError, Result};
use crate::http::ProbeClient;
use crate::prober::{IdentityProber, ProbeResult, RemoteIdentity};
use crate::provider::{PinStatus, PlexTvClient};
use crate::session::{PendingExchange, Phase, SessionContext};
use crate::store::{save_credential, ConfigStore, EnvFileStore, ResolvedCredential};
use crate::token::{SourcedToken, TokenSource};

/// Result of `start`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub pin_id: u64,
    pub code: String,
    pub expires_at: Option<String>,
    pub deeplink: String,
}

/// Result of `poll`
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// PIN not yet approved
    Pending,
    /// PIN approved and candidates built
    ServersReady(Vec<ServerSummary>),
}

/// Caller input for `save`
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub server_url: String,
    /// Claimed machineIdentifier; when set only a matching server can win
    pub server_id: Option<String>,
    pub verify_tls: bool,
    /// Persist the first untested pair when nothing verifies
    pub force: bool,
}

/// Result of a successful `save`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub chosen_url: String,
    pub server_id: String,
    pub token_source: TokenSource,
    pub identity: Option<RemoteIdentity>,
    pub forced: bool,
    pub probes: Vec<ProbeResult>,
}

/// Urls and tokens to try for one save, in priority order
#[derive(Debug, Clone)]
pub struct ProbePlan {
    pub urls: Vec<String>,
    pub tokens: Vec<SourcedToken>,
    pub matched: Option<CandidateServer>,
}

impl ProbePlan {
    /// Match the chosen url to a candidate and expand urls and tokens
    ///
    /// The chosen url is matched by exact uri first, then by host and port.
    /// A loopback url also gets a bridge-host variant. The session's
    /// exchange token is appended last when not already present.
    pub fn build(
        chosen_url: &str,
        candidates: &[CandidateServer],
        exchange_token: Option<&SourcedToken>,
        bridge_host: &str,
    ) -> Self {
        let wanted = chosen_url.trim().trim_end_matches('/');

        let matched = candidates
            .iter()
            .find(|c| c.uri.trim_end_matches('/') == wanted)
            .or_else(|| {
                let want = host_port(wanted)?;
                candidates
                    .iter()
                    .find(|c| host_port(&c.uri).as_ref() == Some(&want))
            })
            .cloned();

        let mut urls: Vec<String> = Vec::new();
        let mut add_url = |u: &str| {
            let u = u.trim_end_matches('/');
            let lower = u.to_lowercase();
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                return;
            }
            if !urls.iter().any(|existing| existing == u) {
                urls.push(u.to_string());
            }
        };
        add_url(wanted);
        if let Some(remapped) = remap_loopback(wanted, bridge_host) {
            add_url(&remapped);
        }

        let mut tokens: Vec<SourcedToken> = Vec::new();
        let matched_tokens = matched.iter().flat_map(|m| m.tokens.iter());
        for t in matched_tokens.chain(exchange_token) {
            if !tokens.iter().any(|existing| existing.token == t.token) {
                tokens.push(t.clone());
            }
        }

        Self {
            urls,
            tokens,
            matched,
        }
    }
}

/// The first qualifying (url, token) pair
#[derive(Debug, Clone)]
struct Winner {
    url: String,
    token: SourcedToken,
    identity: Option<RemoteIdentity>,
}

/// Orchestrates sign-in, discovery, probing and persistence
pub struct Coordinator {
    provider: PlexTvClient,
    prober: IdentityProber,
    http: ProbeClient,
    store: Arc<dyn ConfigStore>,
    audit: Arc<AuditLog>,
    bridge_host: String,
}

impl Coordinator {
    pub fn new(
        provider: PlexTvClient,
        http: ProbeClient,
        store: Arc<dyn ConfigStore>,
        audit: Arc<AuditLog>,
        bridge_host: &str,
    ) -> Self {
        Self {
            provider,
            prober: IdentityProber::new(http.clone()),
            http,
            store,
            audit,
            bridge_host: bridge_host.to_string(),
        }
    }

    /// Wire the engine from configuration: plex.tv client, .env store, audit file
    pub fn from_config(config: &EngineConfig) -> reqwest::Result<Self> {
        let http = ProbeClient::new()?;
        let provider = PlexTvClient::new(
            http.clone(),
            &config.provider_url,
            &config.auth_app_url,
            config.client_identity(),
        );
        Ok(Self::new(
            provider,
            http,
            Arc::new(EnvFileStore::new(&config.env_file)),
            Arc::new(AuditLog::new(&config.audit_log)),
            &config.bridge_host,
        ))
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub(crate) fn http(&self) -> &ProbeClient {
        &self.http
    }

    pub(crate) fn prober(&self) -> &IdentityProber {
        &self.prober
    }

    pub(crate) fn bridge_host(&self) -> &str {
        &self.bridge_host
    }

    /// Create a PIN and the approval link; replaces any earlier exchange
    pub async fn start(&self, session: &mut SessionContext) -> Result<StartOutcome> {
        session.touch();
        self.audit
            .record("action_start", json!({ "clientId": session.client_id }))
            .await;

        let (summary, result) = self.provider.create_pin(&session.client_id).await;
        self.audit.record("pin_start_response", json!(summary)).await;

        let pin = match result {
            Ok(pin) => pin,
            Err(e) => {
                warn!(error = %e, "PIN creation failed");
                session.abandon_exchange(e.code());
                return Err(e);
            }
        };

        let deeplink = self.provider.deeplink(&session.client_id, &pin.code);
        session.begin_exchange(PendingExchange::new(
            pin.id,
            pin.code.clone(),
            pin.expires_at.as_deref(),
        ));

        self.audit
            .record(
                "pin_created",
                json!({ "pinId": pin.id, "code": pin.code, "deeplink": deeplink }),
            )
            .await;
        info!(pin_id = pin.id, "Sign-in started");

        Ok(StartOutcome {
            pin_id: pin.id,
            code: pin.code,
            expires_at: pin.expires_at,
            deeplink,
        })
    }

    /// Check the PIN; on approval discover servers and build candidates
    pub async fn poll(&self, session: &mut SessionContext, pin_id: u64) -> Result<PollOutcome> {
        session.touch();
        self.audit
            .record(
                "action_poll",
                json!({ "clientId": session.client_id, "pinId": pin_id }),
            )
            .await;

        if !session.owns_pin(pin_id, chrono::Utc::now()) {
            // The live PIN, if any, stays pollable
            session.phase = Phase::Failed("unknown_exchange");
            return Err(ResolveError::UnknownExchange);
        }

        let (summary, result) = self.provider.check_pin(&session.client_id, pin_id).await;
        self.audit.record("pin_poll_response", json!(summary)).await;

        let token = match result {
            Ok(PinStatus::Pending) => {
                session.phase = Phase::Polling;
                return Ok(PollOutcome::Pending);
            }
            Ok(PinStatus::Authorized(token)) => token,
            Err(e) => {
                // The PIN stays valid; the caller may poll again
                session.phase = Phase::Failed(e.code());
                return Err(e);
            }
        };

        let (summary, resources) = self
            .provider
            .discover_resources(&session.client_id, &token)
            .await;
        let resources = match resources {
            Ok(resources) => resources,
            Err(e) => {
                self.audit.record("resources_response", json!(summary)).await;
                warn!(error = %e, "Resource discovery failed");
                session.abandon_exchange(e.code());
                return Err(e);
            }
        };

        let candidates = build_candidates(&resources, Some(&token), &self.bridge_host);
        let summaries: Vec<ServerSummary> = candidates.iter().map(CandidateServer::summary).collect();

        self.audit
            .record(
                "servers_built",
                json!({ "count": summaries.len(), "servers": summaries }),
            )
            .await;
        info!(count = summaries.len(), "Candidate servers built");

        session.exchange_token = Some(token);
        session.candidates = candidates;
        session.phase = Phase::ServersReady;

        Ok(PollOutcome::ServersReady(summaries))
    }

    /// Verify the chosen server and persist the first working pair
    pub async fn save(&self, session: &mut SessionContext, request: &SaveRequest) -> Result<SaveOutcome> {
        session.touch();

        let server_url = request.server_url.trim();
        if server_url.is_empty() {
            return Err(ResolveError::InvalidRequest("Missing serverUrl".to_string()));
        }
        let lower = server_url.to_lowercase();
        if !(lower.starts_with("http://") || lower.starts_with("https://")) {
            return Err(ResolveError::InvalidRequest(
                "serverUrl must be http:// or https://".to_string(),
            ));
        }

        let exchange_token = match (&session.exchange_token, session.phase) {
            (_, Phase::Saved) | (None, _) => return Err(ResolveError::ExchangeNotReady),
            (Some(token), _) => SourcedToken {
                token: token.clone(),
                source: TokenSource::ExchangeFallback,
            },
        };

        let claimed = request
            .server_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        session.phase = Phase::Saving;
        self.audit
            .record(
                "action_save_begin",
                json!({
                    "serverUrl": server_url,
                    "verifySsl": request.verify_tls,
                    "requestedServerId": claimed,
                    "force": request.force,
                }),
            )
            .await;

        let plan = ProbePlan::build(
            server_url,
            &session.candidates,
            Some(&exchange_token),
            &self.bridge_host,
        );
        let (probes, winner) = self.run_matrix(&plan, claimed, request.verify_tls).await;

        let tokens_tried: Vec<String> = plan
            .tokens
            .iter()
            .map(|t| format!("{}:{}", t.source, t.token.preview()))
            .collect();
        self.audit
            .record(
                "save_probes",
                json!({
                    "candidates": plan.urls,
                    "tokensTried": tokens_tried,
                    "result": {
                        "okUrl": winner.as_ref().map(|w| w.url.clone()),
                        "okTokenPreview": winner.as_ref().map(|w| w.token.token.preview()),
                        "okTokenSource": winner.as_ref().map(|w| w.token.source),
                        "identity": winner.as_ref().and_then(|w| w.identity.clone()),
                    },
                    "matchedId": plan.matched.as_ref().and_then(|m| m.stable_id.clone()),
                    "requestedServerId": claimed,
                }),
            )
            .await;

        let forced = winner.is_none();
        let winner = match winner {
            Some(w) => w,
            None if request.force => match (plan.urls.first(), plan.tokens.first()) {
                (Some(url), Some(token)) => {
                    warn!(url = %url, source = %token.source, "Force-saving an unverified server");
                    Winner {
                        url: url.clone(),
                        token: token.clone(),
                        identity: None,
                    }
                }
                _ => {
                    session.phase = Phase::Failed("no_working_combination");
                    return Err(ResolveError::NoWorkingCombination { probes });
                }
            },
            None => {
                session.phase = Phase::Failed("no_working_combination");
                return Err(ResolveError::NoWorkingCombination { probes });
            }
        };

        let server_id = claimed
            .map(str::to_string)
            .or_else(|| plan.matched.as_ref().and_then(|m| m.stable_id.clone()))
            .or_else(|| winner.identity.as_ref().and_then(|i| i.stable_id.clone()))
            .unwrap_or_default();

        let credential = ResolvedCredential {
            url: winner.url.trim_end_matches('/').to_string(),
            token: winner.token.token.clone(),
            verify_tls: request.verify_tls,
            server_id: server_id.clone(),
        };

        if let Err(e) = save_credential(self.store.as_ref(), &credential).await {
            self.audit
                .record("save_env_failed", json!({ "message": e.to_string() }))
                .await;
            session.phase = Phase::Failed("persist_failed");
            return Err(ResolveError::PersistFailed(e));
        }

        self.audit
            .record(
                "save_env_ok",
                json!({
                    "PLEX_URL": credential.url,
                    "serverId": if server_id.is_empty() { None } else { Some(&server_id) },
                    "chosenSource": winner.token.source,
                    "forced": forced,
                }),
            )
            .await;
        info!(url = %credential.url, server_id = %server_id, forced, "Credential saved");
        session.phase = Phase::Saved;

        Ok(SaveOutcome {
            chosen_url: credential.url,
            server_id,
            token_source: winner.token.source,
            identity: winner.identity,
            forced,
            probes,
        })
    }

    /// Probe every (url, token) pair until the first qualifying success
    ///
    /// With a claimed server id, an `ok` probe whose identity does not match
    /// is recorded and skipped.
    async fn run_matrix(
        &self,
        plan: &ProbePlan,
        claimed: Option<&str>,
        verify_tls: bool,
    ) -> (Vec<ProbeResult>, Option<Winner>) {
        let mut probes = Vec::new();

        for url in &plan.urls {
            for token in &plan.tokens {
                let result = self.prober.probe(url, token, verify_tls).await;
                let qualifies = result.ok && claimed.map_or(true, |id| result.matches_server(id));
                let identity = result.identity.clone();
                probes.push(result);

                if qualifies {
                    return (
                        probes,
                        Some(Winner {
                            url: url.clone(),
                            token: token.clone(),
                            identity,
                        }),
                    );
                }
            }
        }

        (probes, None)
    }
}
