//! Token → session → pool lifecycle, driven through the dispatcher.
//!
//! No PostgreSQL is needed: pools connect lazily.

use std::sync::Arc;
use std::time::Duration;

use pgmcp::auth::{SessionManager, TokenStore};
use pgmcp::errors::AppError;
use pgmcp::jobs::cleanup;
use pgmcp::llm::LlmGateway;
use pgmcp::mcp::{RequestDispatcher, ToolRegistry};
use pgmcp::store::{ConnectionManager, ConnectionMode, PoolPolicy};
use pgmcp::vault::SecretCipher;

const DATABASE_URL: &str = "postgres://pgmcp@127.0.0.1:5432/pgmcp";

fn dispatcher(dir: &tempfile::TempDir, mode: ConnectionMode, ttl: Duration) -> RequestDispatcher {
    let cipher = Arc::new(SecretCipher::insecure_default());
    let tokens = TokenStore::open(dir.path().join("tokens.yaml"), cipher).unwrap();
    let connections = ConnectionManager::new(mode, PoolPolicy::default(), DATABASE_URL).unwrap();
    RequestDispatcher::new(
        Arc::new(tokens),
        SessionManager::new(ttl),
        Arc::new(connections),
        Arc::new(ToolRegistry::default()),
        LlmGateway::default(),
        10,
    )
}

#[tokio::test]
async fn test_token_session_roundtrip_and_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::Global, Duration::from_millis(50));

    let issued = d.tokens().create("alice laptop", None, None).await.unwrap();
    assert_eq!(d.tokens().validate(&issued.token).await.unwrap(), issued.id);

    let first = d.authenticate(Some(&issued.token)).await.unwrap();
    assert_eq!(first.identity, issued.id);
    let session = first.minted.expect("api token mints a session");
    assert_ne!(session.token, issued.token);

    let again = d.authenticate(Some(&session.token)).await.unwrap();
    assert_eq!(again.identity, issued.id);
    assert!(again.minted.is_none(), "session reuse mints nothing");

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(d.sessions().resolve(&session.token), None);
    let err = d.authenticate(Some(&session.token)).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    // The API token itself still works and mints a fresh session.
    let renewed = d.authenticate(Some(&issued.token)).await.unwrap();
    assert!(renewed.minted.is_some());
}

#[tokio::test]
async fn test_failed_auth_acquires_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_secs(60));

    for credential in [None, Some(""), Some("pgmcp_not-a-real-token"), Some("sess_forged")] {
        let err = d.begin(credential).await.err().expect("must be rejected");
        assert!(matches!(err, AppError::Unauthorized(_)), "{:?}", credential);
    }
    assert_eq!(d.connections().pools_created(), 0);
}

#[tokio::test]
async fn test_expired_token_never_validates() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::Global, Duration::from_secs(60));

    let stale = d
        .tokens()
        .create("stale", Some(chrono::Duration::seconds(-1)), None)
        .await
        .unwrap();
    let forever = d.tokens().create("forever", None, None).await.unwrap();

    assert!(matches!(
        d.tokens().validate(&stale.token).await,
        Err(AppError::Unauthorized(_))
    ));
    assert!(d.begin(Some(&stale.token)).await.is_err());
    assert!(d.begin(Some(&forever.token)).await.is_ok());
}

#[tokio::test]
async fn test_removed_token_loses_sessions_and_pool() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_secs(60));

    let issued = d.tokens().create("ci", None, Some("ci".into())).await.unwrap();
    let ctx = d.begin(Some(&issued.token)).await.unwrap();
    let session = ctx.minted.clone().unwrap();
    assert_eq!(d.connections().live_pools(), 1);

    d.tokens().remove("ci").await.unwrap();
    let report = cleanup::sweep(&d, Duration::from_secs(600)).await;

    assert_eq!(report.retired, vec!["ci".to_string()]);
    assert_eq!(d.sessions().resolve(&session.token), None);
    assert_eq!(d.connections().live_pools(), 0);
    assert!(ctx.db.pool().is_closed());
    assert!(matches!(d.bind("ci").await, Err(AppError::ResourceGone(_))));
}

#[tokio::test]
async fn test_sweep_releases_pools_of_expired_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_millis(30));

    let issued = d.tokens().create("short", None, None).await.unwrap();
    d.begin(Some(&issued.token)).await.unwrap();
    assert_eq!(d.connections().live_pools(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = cleanup::sweep(&d, Duration::from_secs(600)).await;

    assert_eq!(report.expired_sessions, 1);
    assert_eq!(report.released, vec![issued.id.clone()]);
    assert!(report.retired.is_empty());
    assert_eq!(d.connections().live_pools(), 0);

    // Released, not retired: the token can come back.
    assert!(d.begin(Some(&issued.token)).await.is_ok());
    assert_eq!(d.connections().pools_created(), 2);
}

#[tokio::test]
async fn test_repeated_api_token_keeps_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_secs(60));

    let issued = d.tokens().create("chatty", None, None).await.unwrap();
    let first = d.begin(Some(&issued.token)).await.unwrap();
    for _ in 0..1000 {
        let ctx = d.begin(Some(&issued.token)).await.unwrap();
        assert_eq!(ctx.session, first.session);
    }
    assert_eq!(d.sessions().len(), 1);
    assert_eq!(d.connections().pools_created(), 1);
}

#[tokio::test]
async fn test_logout_drains_pool() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_secs(60));

    let issued = d.tokens().create("laptop", None, None).await.unwrap();
    let ctx = d.begin(Some(&issued.token)).await.unwrap();
    assert_eq!(d.connections().live_pools(), 1);

    let reply = d.logout(&ctx).await;
    assert!(reply.revoked);
    assert!(reply.released);
    assert!(ctx.db.pool().is_closed());
    assert_eq!(d.sessions().resolve(&ctx.session), None);
    assert!(matches!(
        d.authenticate(Some(&ctx.session)).await,
        Err(AppError::Unauthorized(_))
    ));

    // Logging out twice is harmless.
    let again = d.logout(&ctx).await;
    assert!(!again.revoked);

    // Not retired: the token logs in again with a fresh pool.
    let back = d.begin(Some(&issued.token)).await.unwrap();
    assert_ne!(back.session, ctx.session);
    assert_eq!(d.connections().pools_created(), 2);
}

#[tokio::test]
async fn test_reissued_id_drops_old_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let d = dispatcher(&dir, ConnectionMode::PerToken, Duration::from_secs(60));

    let old = d.tokens().create("", None, Some("alice".into())).await.unwrap();
    let ctx = d.begin(Some(&old.token)).await.unwrap();

    // An administrator replaces the token from another process.
    let admin = TokenStore::open(
        d.tokens().path().to_path_buf(),
        Arc::new(SecretCipher::insecure_default()),
    )
    .unwrap();
    admin.remove("alice").await.unwrap();
    let new = admin.create("", None, Some("alice".into())).await.unwrap();

    let report = cleanup::sweep(&d, Duration::from_secs(600)).await;
    assert_eq!(report.retired, vec!["alice".to_string()]);
    assert_eq!(d.sessions().resolve(&ctx.session), None);
    assert!(d.begin(Some(&old.token)).await.is_err());

    let fresh = d.begin(Some(&new.token)).await.unwrap();
    assert_eq!(fresh.identity, "alice");
    assert!(!fresh.db.pool().is_closed());
}
