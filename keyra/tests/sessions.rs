use std::sync::Arc;

use chrono::{Duration, Utc};
use keyra::{
    AuthError, Error, Keyra, KeyraBuilder, KeyraError, Login, RequestMetadata, SessionError,
    SessionId, SqliteRepositoryProvider,
};
use keyra_core::services::FixedWindowRateLimiter;

async fn keyra() -> Keyra<SqliteRepositoryProvider> {
    KeyraBuilder::new()
        .with_sqlite("sqlite::memory:")
        .await
        .unwrap()
        .apply_migrations(true)
        .build()
        .await
        .unwrap()
}

async fn login(keyra: &Keyra<SqliteRepositoryProvider>, email: &str) -> Login {
    let metadata = RequestMetadata::default();
    let issued = keyra.issue_magic_link(email, &metadata).await.unwrap();
    keyra
        .verify_magic_link(issued.token.expose(), &metadata)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_logout_by_refresh_token() {
    let keyra = keyra().await;
    let login = login(&keyra, "logout@example.com").await;

    let session_id = keyra.logout(login.refresh_token.expose()).await.unwrap();
    assert_eq!(session_id, login.session.id);
    assert!(!keyra.is_session_active(&session_id).await.unwrap());

    let refresh = keyra
        .rotate_refresh(login.refresh_token.expose(), &RequestMetadata::default())
        .await;
    assert!(matches!(
        refresh,
        Err(KeyraError::Core(Error::Auth(AuthError::FamilyRevoked)))
    ));

    let unknown = keyra.logout("never-issued").await;
    assert!(matches!(
        unknown,
        Err(KeyraError::Core(Error::Auth(AuthError::TokenUnknown)))
    ));
}

#[tokio::test]
async fn test_logout_all_revokes_every_session() {
    let keyra = keyra().await;
    let first = login(&keyra, "many@example.com").await;
    let second = login(&keyra, "many@example.com").await;
    let other = login(&keyra, "other@example.com").await;

    let sessions = keyra.list_sessions(&first.user.id).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, second.session.id);

    let revoked = keyra.logout_all(&first.user.id).await.unwrap();
    assert_eq!(revoked, 2);
    assert!(!keyra.is_session_active(&first.session.id).await.unwrap());
    assert!(!keyra.is_session_active(&second.session.id).await.unwrap());
    assert!(keyra.is_session_active(&other.session.id).await.unwrap());

    // Nothing left to revoke.
    assert_eq!(keyra.logout_all(&first.user.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_revoke_unknown_session() {
    let keyra = keyra().await;

    let result = keyra.revoke_session(&SessionId::new_random()).await;
    assert!(matches!(
        result,
        Err(KeyraError::Core(Error::Session(SessionError::NotFound)))
    ));
}

#[tokio::test]
async fn test_access_token_outlives_revocation_but_authenticate_does_not() {
    let keyra = keyra().await;
    let login = login(&keyra, "access@example.com").await;
    let access_token = &login.access_token.token;

    let claims = keyra.verify_access_token(access_token).unwrap();
    assert_eq!(claims.session_id(), login.session.id);
    assert_eq!(claims.user_id(), login.user.id);

    keyra.revoke_session(&login.session.id).await.unwrap();

    assert!(keyra.verify_access_token(access_token).is_ok());
    let result = keyra.authenticate(access_token).await;
    assert!(matches!(
        result,
        Err(KeyraError::Core(Error::Session(SessionError::Revoked)))
    ));
}

#[tokio::test]
async fn test_tampered_access_token_rejected() {
    let keyra = keyra().await;
    let login = login(&keyra, "tamper@example.com").await;

    let mut tampered = login.access_token.token.clone();
    tampered.push('x');
    let result = keyra.verify_access_token(&tampered);
    assert!(matches!(result, Err(KeyraError::Core(Error::Crypto(_)))));
}

#[tokio::test]
async fn test_sweep_removes_expired_records() {
    let keyra = keyra().await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "sweep@example.com").await;
    keyra
        .issue_magic_link("pending@example.com", &metadata)
        .await
        .unwrap();

    // Nothing has expired yet.
    let report = keyra.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(report.total(), 0);
    assert!(keyra.get_session(&login.session.id).await.unwrap().is_some());

    let report = keyra
        .sweep_expired(Utc::now() + Duration::days(60))
        .await
        .unwrap();
    assert_eq!(report.magic_links, 2);
    assert_eq!(report.sessions, 1);
    assert!(keyra.get_session(&login.session.id).await.unwrap().is_none());

    // Users are kept.
    assert!(keyra.get_user(&login.user.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sweep_drops_elapsed_rate_limit_windows() {
    let limiter = Arc::new(FixedWindowRateLimiter::new(5, Duration::minutes(10)));
    let keyra = KeyraBuilder::new()
        .with_sqlite("sqlite::memory:")
        .await
        .unwrap()
        .with_rate_limiter(limiter.clone())
        .apply_migrations(true)
        .build()
        .await
        .unwrap();

    let metadata = RequestMetadata::default();
    for email in ["a@example.com", "b@example.com", "c@example.com"] {
        keyra.issue_magic_link(email, &metadata).await.unwrap();
    }
    assert_eq!(limiter.len(), 3);

    keyra.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(limiter.len(), 3);

    keyra
        .sweep_expired(Utc::now() + Duration::minutes(11))
        .await
        .unwrap();
    assert!(limiter.is_empty());
}
