//! End-to-end resolution against mocked plex.tv and media servers

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use plex_resolver::audit::AuditLog;
use plex_resolver::check::DiagnoseOptions;
use plex_resolver::config::EngineConfig;
use plex_resolver::coordinator::{Coordinator, PollOutcome, SaveRequest};
use plex_resolver::http::ProbeClient;
use plex_resolver::provider::PlexTvClient;
use plex_resolver::session::{Phase, SessionContext};
use plex_resolver::store::{load_credential, ConfigStore, EnvFileStore};
use plex_resolver::token::TokenSource;

const ACCOUNT_TOKEN: &str = "account-token-xyz";

struct Harness {
    provider: MockServer,
    dir: TempDir,
    coordinator: Arc<Coordinator>,
    store: Arc<EnvFileStore>,
}

impl Harness {
    async fn new() -> Self {
        let provider = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(EnvFileStore::new(dir.path().join(".env")));

        let http = ProbeClient::new().unwrap();
        let client = PlexTvClient::new(
            http.clone(),
            &provider.uri(),
            "https://app.plex.tv/auth",
            EngineConfig::default().client_identity(),
        );
        let coordinator = Coordinator::new(
            client,
            http,
            store.clone(),
            Arc::new(AuditLog::new(dir.path().join("audit.log"))),
            "127.0.0.1",
        );

        Self {
            provider,
            dir,
            coordinator: Arc::new(coordinator),
            store,
        }
    }

    async fn mount_pin_flow(&self, resources: Value) {
        Mock::given(method("POST"))
            .and(path("/api/v2/pins"))
            .and(query_param("strong", "true"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 42,
                "code": "ABCD",
                "expiresAt": "2999-01-01T00:00:00Z"
            })))
            .mount(&self.provider)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/pins/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "code": "ABCD",
                "authToken": null
            })))
            .up_to_n_times(1)
            .mount(&self.provider)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/pins/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 42,
                "code": "ABCD",
                "authToken": ACCOUNT_TOKEN
            })))
            .mount(&self.provider)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v2/resources"))
            .and(header("X-Plex-Token", ACCOUNT_TOKEN))
            .respond_with(ResponseTemplate::new(200).set_body_json(resources))
            .mount(&self.provider)
            .await;
    }

    /// Run start and poll until servers are ready
    async fn signed_in(&self) -> SessionContext {
        let mut session = SessionContext::new();
        let started = self.coordinator.start(&mut session).await.unwrap();
        loop {
            match self.coordinator.poll(&mut session, started.pin_id).await.unwrap() {
                PollOutcome::Pending => continue,
                PollOutcome::ServersReady(_) => return session,
            }
        }
    }

    fn audit_events(&self) -> Vec<Value> {
        read_lines(&self.dir.path().join("audit.log"))
    }
}

fn read_lines(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn server_resource(id: &str, token: Option<&str>, uris: &[String]) -> Value {
    json!({
        "name": format!("Server {}", id),
        "clientIdentifier": id,
        "provides": "server",
        "product": "Plex Media Server",
        "accessToken": token,
        "connections": uris
            .iter()
            .map(|u| json!({"uri": u, "local": true, "protocol": "http"}))
            .collect::<Vec<_>>()
    })
}

async fn identity_mock(media: &MockServer, token: &str, status: u16, machine: Option<&str>) {
    let mut response = ResponseTemplate::new(status);
    if let Some(machine) = machine {
        response = response.set_body_json(json!({
            "machineIdentifier": machine,
            "version": "1.40.0"
        }));
    }
    Mock::given(method("GET"))
        .and(path("/identity"))
        .and(header("X-Plex-Token", token))
        .respond_with(response)
        .mount(media)
        .await;
}

#[tokio::test]
async fn test_start_returns_pin_and_deeplink() {
    let h = Harness::new().await;
    h.mount_pin_flow(json!([])).await;

    let mut session = SessionContext::new();
    let started = h.coordinator.start(&mut session).await.unwrap();

    assert_eq!(started.pin_id, 42);
    assert_eq!(started.code, "ABCD");
    assert!(started.deeplink.starts_with("https://app.plex.tv/auth#?"));
    assert!(started.deeplink.contains(&format!("clientID={}", session.client_id)));
    assert!(started.deeplink.contains("code=ABCD"));
    assert_eq!(session.phase, Phase::Started);
}

#[tokio::test]
async fn test_poll_pending_then_servers_without_tokens() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    h.mount_pin_flow(json!([server_resource(
        "machine-a",
        Some("resource-token-a"),
        &[format!("{}?X-Plex-Token=uri-token-a", media.uri())]
    )]))
    .await;

    let mut session = SessionContext::new();
    let started = h.coordinator.start(&mut session).await.unwrap();

    let first = h.coordinator.poll(&mut session, started.pin_id).await.unwrap();
    assert!(matches!(first, PollOutcome::Pending));
    assert_eq!(session.phase, Phase::Polling);

    let PollOutcome::ServersReady(servers) =
        h.coordinator.poll(&mut session, started.pin_id).await.unwrap()
    else {
        panic!("expected servers");
    };
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id.as_deref(), Some("machine-a"));
    assert_eq!(servers[0].uri, media.uri());
    assert_eq!(servers[0].tokens.len(), 3);

    let payload = serde_json::to_string(&servers).unwrap();
    assert!(!payload.contains("resource-token-a"));
    assert!(!payload.contains("uri-token-a"));
    assert!(!payload.contains(ACCOUNT_TOKEN));
    assert_eq!(session.phase, Phase::ServersReady);

    let audit = std::fs::read_to_string(h.dir.path().join("audit.log")).unwrap();
    assert!(!audit.contains(ACCOUNT_TOKEN));
    assert!(!audit.contains("resource-token-a"));
}

#[tokio::test]
async fn test_poll_unknown_pin_is_rejected() {
    let h = Harness::new().await;
    h.mount_pin_flow(json!([])).await;

    let mut session = SessionContext::new();
    let err = h.coordinator.poll(&mut session, 42).await.unwrap_err();
    assert_eq!(err.code(), "unknown_exchange");

    h.coordinator.start(&mut session).await.unwrap();
    let err = h.coordinator.poll(&mut session, 999).await.unwrap_err();
    assert_eq!(err.code(), "unknown_exchange");
}

#[tokio::test]
async fn test_save_before_sign_in_not_ready() {
    let h = Harness::new().await;
    let mut session = SessionContext::new();

    let request = SaveRequest {
        server_url: "http://127.0.0.1:32400".into(),
        verify_tls: true,
        ..Default::default()
    };
    let err = h.coordinator.save(&mut session, &request).await.unwrap_err();
    assert_eq!(err.code(), "exchange_not_ready");

    let empty = SaveRequest::default();
    let err = h.coordinator.save(&mut session, &empty).await.unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_unreachable_server_reports_probes_and_writes_nothing() {
    let h = Harness::new().await;
    h.mount_pin_flow(json!([server_resource(
        "machine-a",
        Some("resource-token-a"),
        &["http://127.0.0.1:1".to_string()]
    )]))
    .await;
    let mut session = h.signed_in().await;

    let request = SaveRequest {
        server_url: "http://127.0.0.1:1".into(),
        verify_tls: true,
        ..Default::default()
    };
    let err = h.coordinator.save(&mut session, &request).await.unwrap_err();

    assert_eq!(err.code(), "no_working_combination");
    let probes = err.probes().unwrap();
    assert_eq!(probes.len(), 2);
    assert!(probes.iter().all(|p| !p.ok && p.http_code == 0));
    assert_eq!(probes[0].token_source, TokenSource::ResourceLevel);
    assert_eq!(probes[1].token_source, TokenSource::ExchangeFallback);
    assert_eq!(probes[1].token_preview, "accoun...");

    assert!(!h.store.path().exists());
    assert_eq!(session.phase, Phase::Failed("no_working_combination"));
}

#[tokio::test]
async fn test_force_save_persists_first_pair() {
    let h = Harness::new().await;
    h.mount_pin_flow(json!([server_resource(
        "machine-a",
        Some("resource-token-a"),
        &["http://127.0.0.1:1".to_string()]
    )]))
    .await;
    let mut session = h.signed_in().await;

    let request = SaveRequest {
        server_url: "http://127.0.0.1:1".into(),
        verify_tls: false,
        force: true,
        ..Default::default()
    };
    let saved = h.coordinator.save(&mut session, &request).await.unwrap();

    assert!(saved.forced);
    assert_eq!(saved.server_id, "machine-a");
    assert_eq!(saved.token_source, TokenSource::ResourceLevel);

    let cred = load_credential(h.store.as_ref()).await.unwrap().unwrap();
    assert_eq!(cred.url, "http://127.0.0.1:1");
    assert_eq!(cred.token.expose(), "resource-token-a");
    assert!(!cred.verify_tls);
    assert_eq!(cred.server_id, "machine-a");
    assert_eq!(session.phase, Phase::Saved);

    let again = h.coordinator.save(&mut session, &request).await.unwrap_err();
    assert_eq!(again.code(), "exchange_not_ready");
}

#[tokio::test]
async fn test_claimed_server_id_skips_wrong_machine() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    identity_mock(&media, "resource-token-a", 401, None).await;
    identity_mock(&media, "uri-token-a", 200, Some("wrong-machine")).await;
    identity_mock(&media, ACCOUNT_TOKEN, 200, Some("MACHINE-A")).await;

    h.mount_pin_flow(json!([server_resource(
        "machine-a",
        Some("resource-token-a"),
        &[format!("{}?X-Plex-Token=uri-token-a", media.uri())]
    )]))
    .await;
    let mut session = h.signed_in().await;

    let request = SaveRequest {
        server_url: media.uri(),
        server_id: Some("machine-a".into()),
        verify_tls: true,
        force: false,
    };
    let saved = h.coordinator.save(&mut session, &request).await.unwrap();

    assert!(!saved.forced);
    assert_eq!(saved.probes.len(), 3);
    assert_eq!(saved.probes[0].http_code, 401);
    assert!(saved.probes[1].ok);
    assert_eq!(saved.token_source, TokenSource::ExchangeFallback);
    assert_eq!(saved.server_id, "machine-a");

    let cred = load_credential(h.store.as_ref()).await.unwrap().unwrap();
    assert_eq!(cred.token.expose(), ACCOUNT_TOKEN);
    assert_eq!(cred.url, media.uri());

    let events: Vec<String> = h
        .audit_events()
        .iter()
        .map(|e| e["event"].as_str().unwrap().to_string())
        .collect();
    assert!(events.contains(&"save_probes".to_string()));
    assert_eq!(events.last().map(String::as_str), Some("save_env_ok"));
}

#[tokio::test]
async fn test_first_success_short_circuits() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    identity_mock(&media, "resource-token-a", 200, Some("machine-a")).await;
    Mock::given(path("/identity"))
        .and(header("X-Plex-Token", ACCOUNT_TOKEN))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&media)
        .await;

    h.mount_pin_flow(json!([server_resource(
        "machine-a",
        Some("resource-token-a"),
        &[media.uri()]
    )]))
    .await;
    let mut session = h.signed_in().await;

    let request = SaveRequest {
        server_url: format!("{}/", media.uri()),
        verify_tls: true,
        ..Default::default()
    };
    let saved = h.coordinator.save(&mut session, &request).await.unwrap();
    assert_eq!(saved.probes.len(), 1);
    assert_eq!(saved.identity.unwrap().stable_id.as_deref(), Some("machine-a"));
}

#[tokio::test]
async fn test_existing_env_keys_preserved() {
    let h = Harness::new().await;
    std::fs::write(h.store.path(), "# playlist settings\nSPOTIFY_ID=abc\nPLEX_URL=http://old\n").unwrap();

    let media = MockServer::start().await;
    identity_mock(&media, ACCOUNT_TOKEN, 200, Some("machine-m")).await;
    h.mount_pin_flow(json!([])).await;
    let mut session = h.signed_in().await;

    // Manual url with no candidate match gets the account token only
    let request = SaveRequest {
        server_url: media.uri(),
        verify_tls: true,
        ..Default::default()
    };
    let saved = h.coordinator.save(&mut session, &request).await.unwrap();
    assert_eq!(saved.server_id, "machine-m");

    let values: BTreeMap<String, String> = h.store.read_all().await.unwrap();
    assert_eq!(values["SPOTIFY_ID"], "abc");
    assert_eq!(values["PLEX_URL"], media.uri());
    assert_eq!(values["PLEX_SERVER_ID"], "machine-m");
    assert!(std::fs::read_to_string(h.store.path())
        .unwrap()
        .starts_with("# playlist settings"));
}

#[tokio::test]
async fn test_concurrent_saves_never_mix() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    let url_a = format!("{}/a", media.uri());
    let url_b = format!("{}/b", media.uri());
    Mock::given(path("/a/identity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"machineIdentifier": "machine-a"})))
        .mount(&media)
        .await;
    Mock::given(path("/b/identity"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"machineIdentifier": "machine-b"})))
        .mount(&media)
        .await;

    h.mount_pin_flow(json!([
        server_resource("machine-a", Some("resource-token-a"), &[url_a.clone()]),
        server_resource("machine-b", Some("resource-token-b"), &[url_b.clone()]),
    ]))
    .await;

    let mut handles = Vec::new();
    for (i, url) in [url_a, url_b].into_iter().cycle().take(8).enumerate() {
        let h_coord = h.coordinator.clone();
        let mut session = h.signed_in().await;
        handles.push(tokio::spawn(async move {
            let request = SaveRequest {
                server_url: url,
                verify_tls: i % 2 == 0,
                ..Default::default()
            };
            h_coord.save(&mut session, &request).await.map(|s| s.chosen_url)
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let cred = load_credential(h.store.as_ref()).await.unwrap().unwrap();
    let expected = if cred.url.ends_with("/a") {
        ("resource-token-a", "machine-a", true)
    } else {
        ("resource-token-b", "machine-b", false)
    };
    assert_eq!(cred.token.expose(), expected.0);
    assert_eq!(cred.server_id, expected.1);
    assert_eq!(cred.verify_tls, expected.2);
}

#[tokio::test]
async fn test_diagnose_stored_credential_per_endpoint() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    identity_mock(&media, "stored-token-1", 200, Some("machine-d")).await;
    Mock::given(method("GET"))
        .and(path("/:/prefs"))
        .and(header("x-plex-token", "stored-token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MediaContainer": {"Setting": [{"id": "PlexOnlineToken", "value": "server-secret-99"}]}
        })))
        .mount(&media)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/sessions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&media)
        .await;
    Mock::given(method("GET"))
        .and(path("/library/sections"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "MediaContainer": {"Directory": [{"key": "3", "title": "Shows", "type": "show"}]}
        })))
        .mount(&media)
        .await;
    std::fs::write(
        h.store.path(),
        format!("PLEX_URL={}\nPLEX_TOKEN=stored-token-1\nPLEX_VERIFY_SSL=true\n", media.uri()),
    )
    .unwrap();

    let compare = format!("{}/photo/x?width=10&X-Plex-Token=stored-token-1", media.uri());
    let report = h
        .coordinator
        .diagnose(&DiagnoseOptions {
            compare_url: Some(compare),
            ..Default::default()
        })
        .await;

    assert!(report.ok);
    assert!(report.verify_tls);
    assert!(!report.url_overridden && !report.token_overridden);
    assert_eq!(report.effective_url.as_deref(), Some(media.uri().as_str()));
    assert_eq!(report.token_preview.as_deref(), Some("stored..."));
    let codes: Vec<(String, u16, bool)> = report
        .endpoints
        .iter()
        .map(|e| (e.path.clone(), e.http_code, e.ok))
        .collect();
    assert_eq!(
        codes,
        vec![
            ("/identity".to_string(), 200, true),
            ("/:/prefs".to_string(), 200, true),
            ("/status/sessions".to_string(), 401, false),
            ("/library/sections".to_string(), 200, true),
        ]
    );
    assert_eq!(
        report.identity.as_ref().and_then(|i| i.stable_id.as_deref()),
        Some("machine-d")
    );
    assert_eq!(report.sections[0].title, "Shows");

    let comparison = report.comparison.as_ref().unwrap();
    assert!(comparison.present);
    assert_eq!(comparison.matches, Some(true));

    let rendered = serde_json::to_string(&report).unwrap();
    assert!(!rendered.contains("stored-token-1"));
    assert!(!rendered.contains("server-secret-99"));
}

#[tokio::test]
async fn test_diagnose_overrides_win_over_store() {
    let h = Harness::new().await;
    let media = MockServer::start().await;
    identity_mock(&media, "override-token", 200, Some("machine-o")).await;
    std::fs::write(h.store.path(), "PLEX_URL=http://127.0.0.1:1\nPLEX_TOKEN=stored-token-1\n").unwrap();

    let report = h
        .coordinator
        .diagnose(&DiagnoseOptions {
            url: Some(media.uri()),
            token: Some("override-token".into()),
            verify_tls: Some(false),
            compare_url: Some("http://nas:32400/photo?X-Plex-Token=other-token".into()),
            no_remap: true,
        })
        .await;

    assert!(report.ok);
    assert!(report.url_overridden && report.token_overridden);
    assert!(!report.remapped);
    assert!(!report.verify_tls);
    let comparison = report.comparison.unwrap();
    assert_eq!(comparison.matches, Some(false));
    assert_eq!(comparison.preview.as_deref(), Some("other-..."));
}

#[tokio::test]
async fn test_diagnose_loopback_remap_and_missing_token() {
    let h = Harness::new().await;
    std::fs::write(h.store.path(), "PLEX_URL=http://localhost:1/\n").unwrap();

    let missing = h.coordinator.diagnose(&DiagnoseOptions::default()).await;
    assert!(!missing.ok);
    assert_eq!(missing.error.as_deref(), Some("missing_credential"));
    assert!(missing.endpoints.is_empty());

    let remapped = h
        .coordinator
        .diagnose(&DiagnoseOptions {
            token: Some("some-token".into()),
            ..Default::default()
        })
        .await;
    assert!(remapped.remapped);
    assert_eq!(remapped.effective_url.as_deref(), Some("http://127.0.0.1:1"));
    assert!(!remapped.ok);
    assert_eq!(remapped.endpoints.len(), 4);
    assert!(remapped.endpoints.iter().all(|e| e.http_code == 0));
}
