use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use aliri_base64::Base64Url;
use color_eyre::Result;
use serde_json::json;
use url::Url;
use warden::{
    Config, HandoverError, Navigator, RenewalStrategy, Session, SessionError,
};
use warden_tokens::{InMemoryStore, PersistentStore, RestrictedCheck};
use wiremock::{
    matchers::{body_json, method, path},
    Mock, MockServer, ResponseTemplate,
};

#[derive(Debug, Default)]
struct RecordingNavigator {
    visited: Mutex<Vec<Url>>,
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, url: &Url) {
        self.visited.lock().unwrap().push(url.clone());
    }
}

fn token_expiring_in(secs: u64) -> String {
    let exp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + secs;
    let header = Base64Url::from_raw(br#"{"alg":"none"}"#.to_vec());
    let payload = Base64Url::from_raw(serde_json::to_vec(&json!({ "exp": exp })).unwrap());
    format!("{}.{}.signature", header, payload)
}

fn config(server: &MockServer) -> Config {
    Config::builder("app-123")
        .auth_base_url(server.uri())
        .flags_base_url(server.uri())
        .team_management_url("https://portal.example.com/users")
        .callback_url("https://app.example.com/auth/callback")
        .build()
        .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn mount_flags(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/flags/bulkEvaluate/app-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "flags": [{ "flag": "beta", "evaluation": { "enabled": true } }]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn invalid_config_fails_to_start() {
    let config = Config::default();
    let err = Session::start(
        config,
        InMemoryStore::new(),
        Arc::new(RecordingNavigator::default()),
        None,
    )
    .unwrap_err();

    assert!(matches!(err, SessionError::Config(_)));
}

#[tokio::test]
async fn callback_stores_tokens_and_signs_in() -> Result<()> {
    let server = MockServer::start().await;
    let access = token_expiring_in(3600);
    Mock::given(method("POST"))
        .and(path("/token/code/app-123"))
        .and(body_json(json!({ "code": "abc" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access,
            "refresh_token": "refresh-1",
            "id_token": "not-a-jwt",
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_flags(&server).await;

    let session = Session::start(
        config(&server),
        InMemoryStore::new(),
        Arc::new(RecordingNavigator::default()),
        None,
    )?;
    let authenticated = session.authenticated();
    assert!(!*authenticated.borrow());

    let route = session.complete_callback(Some("abc")).await;
    assert_eq!(route, "/");

    assert!(session.auth().is_authenticated());
    assert!(eventually(|| *authenticated.borrow()).await);
    assert!(eventually(|| session.flags().flag_enabled("beta")).await);

    // An unverifiable identity token leaves no profile
    assert!(session.profile().current_profile().is_none());

    Ok(())
}

#[tokio::test]
async fn failed_callback_returns_to_login() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token/code/app-123"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_code"))
        .expect(1)
        .mount(&server)
        .await;

    let session = Session::start(
        config(&server),
        InMemoryStore::new(),
        Arc::new(RecordingNavigator::default()),
        None,
    )?;

    assert_eq!(session.complete_callback(Some("bad")).await, "/login");
    assert_eq!(session.complete_callback(None).await, "/login");
    assert!(!session.auth().is_authenticated());

    Ok(())
}

#[tokio::test]
async fn login_redirect_clears_tokens_and_navigates() -> Result<()> {
    let server = MockServer::start().await;
    let mut storage = InMemoryStore::new();
    storage.set("access_token", &token_expiring_in(3600)).unwrap();

    let navigator = Arc::new(RecordingNavigator::default());
    let session = Session::start(config(&server), storage, navigator.clone(), None)?;
    assert!(session.auth().is_authenticated());

    let url = session.login().redirect_to_login()?;

    assert_eq!(url.path(), "/url/login/app-123");
    assert_eq!(
        url.query(),
        Some("redirect_uri=https%3A%2F%2Fapp.example.com%2Fauth%2Fcallback")
    );
    assert!(session.tokens().access_token().is_none());
    assert_eq!(*navigator.visited.lock().unwrap(), vec![url]);

    Ok(())
}

#[tokio::test]
async fn team_management_url_carries_handover_code() -> Result<()> {
    let server = MockServer::start().await;
    let access = token_expiring_in(3600);
    Mock::given(method("POST"))
        .and(path("/handover/code/app-123"))
        .and(body_json(json!({ "accessToken": access })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": "h-1" })))
        .expect(1)
        .mount(&server)
        .await;
    mount_flags(&server).await;

    let mut storage = InMemoryStore::new();
    storage.set("access_token", &access).unwrap();
    let session = Session::start(
        config(&server),
        storage,
        Arc::new(RecordingNavigator::default()),
        None,
    )?;

    let url = session.team().team_management_url().await?;
    assert_eq!(url.as_str(), "https://portal.example.com/users?code=h-1");

    Ok(())
}

#[tokio::test]
async fn team_management_requires_access_token() -> Result<()> {
    let server = MockServer::start().await;
    let session = Session::start(
        config(&server),
        InMemoryStore::new(),
        Arc::new(RecordingNavigator::default()),
        None,
    )?;

    let err = session.team().team_management_url().await.unwrap_err();
    assert!(matches!(err, HandoverError::NotAuthenticated));

    Ok(())
}

fn refresh_cycle_config(server: &MockServer) -> Config {
    Config {
        renewal: RenewalStrategy::RefreshCycle,
        ..config(server)
    }
}

#[tokio::test]
async fn refresh_cycle_renews_stored_refresh_token_on_start() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_json(json!({
            "client_id": "app-123",
            "grant_type": "refresh_token",
            "refresh_token": "refresh-1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token_expiring_in(3600),
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_flags(&server).await;

    let mut storage = InMemoryStore::new();
    storage.set("refresh_token", "refresh-1").unwrap();
    let session = Session::start(
        refresh_cycle_config(&server),
        storage,
        Arc::new(RecordingNavigator::default()),
        None,
    )?;

    assert!(session.scheduler_state().is_none());
    assert!(eventually(|| session.auth().is_authenticated()).await);
    assert!(session.refresher().is_cycle_running());

    let refresher = session.refresher().clone();
    session.shutdown();
    assert!(!refresher.is_cycle_running());

    Ok(())
}

#[tokio::test]
async fn restricted_route_blocks_refresh_cycle() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut storage = InMemoryStore::new();
    storage.set("refresh_token", "refresh-1").unwrap();
    let config = refresh_cycle_config(&server);
    let on_callback: RestrictedCheck = {
        let config = config.clone();
        Arc::new(move || config.is_restricted_route("/auth/callback?code=abc"))
    };

    let session = Session::start(
        config,
        storage,
        Arc::new(RecordingNavigator::default()),
        Some(on_callback),
    )?;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.refresher().is_cycle_running());

    Ok(())
}

#[tokio::test]
async fn expiry_scheduled_session_renews_expired_access_token() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token_expiring_in(3600),
            "refresh_token": "refresh-2",
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_flags(&server).await;

    let mut storage = InMemoryStore::new();
    storage.set("refresh_token", "refresh-1").unwrap();
    let session = Session::start(
        config(&server),
        storage,
        Arc::new(RecordingNavigator::default()),
        None,
    )?;

    assert!(eventually(|| session.auth().is_authenticated()).await);
    assert_eq!(
        session.tokens().refresh_token().map(|t| t.as_str().to_owned()),
        Some("refresh-2".to_owned())
    );
    assert!(eventually(|| matches!(
        session.scheduler_state(),
        Some(warden_tokens::SchedulerState::Scheduled { .. })
    ))
    .await);

    Ok(())
}
