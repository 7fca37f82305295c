use chrono::Duration;
use keyra::{
    AuthError, Error, Keyra, KeyraBuilder, KeyraConfig, KeyraError, Login, RequestMetadata,
    SqliteRepositoryProvider, TokenCodec,
};
use sqlx::SqlitePool;

async fn keyra_with(config: KeyraConfig) -> (Keyra<SqliteRepositoryProvider>, SqlitePool) {
    let provider = SqliteRepositoryProvider::connect("sqlite::memory:")
        .await
        .unwrap();
    let pool = provider.pool().clone();

    let keyra = KeyraBuilder::new()
        .with_config(config)
        .with_sqlite_pool(pool.clone())
        .apply_migrations(true)
        .build()
        .await
        .unwrap();

    (keyra, pool)
}

/// A database file shared by a pool of several connections, so concurrent
/// calls really overlap inside SQLite.
async fn file_keyra() -> (tempfile::TempDir, Keyra<SqliteRepositoryProvider>, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("keyra.db").display());
    let provider = SqliteRepositoryProvider::connect(&url).await.unwrap();
    let pool = provider.pool().clone();

    let keyra = KeyraBuilder::new()
        .with_sqlite_pool(pool.clone())
        .apply_migrations(true)
        .build()
        .await
        .unwrap();

    (dir, keyra, pool)
}

async fn keyra() -> (Keyra<SqliteRepositoryProvider>, SqlitePool) {
    keyra_with(KeyraConfig::default()).await
}

async fn login(keyra: &Keyra<SqliteRepositoryProvider>, email: &str) -> Login {
    let metadata = RequestMetadata::default();
    let issued = keyra.issue_magic_link(email, &metadata).await.unwrap();
    keyra
        .verify_magic_link(issued.token.expose(), &metadata)
        .await
        .unwrap()
}

fn auth_error(result: Result<impl std::fmt::Debug, KeyraError>) -> AuthError {
    match result {
        Err(KeyraError::Core(Error::Auth(reason))) => reason,
        other => panic!("expected an authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rotation_chain_then_reuse_revokes_family() {
    let (keyra, _) = keyra().await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "chain@example.com").await;
    let r0 = login.refresh_token;

    let first = keyra.rotate_refresh(r0.expose(), &metadata).await.unwrap();
    assert_eq!(first.generation, 1);
    assert_eq!(first.session.id, login.session.id);
    assert!(first.refresh_expires_at <= first.session.expires_at);

    let second = keyra
        .rotate_refresh(first.refresh_token.expose(), &metadata)
        .await
        .unwrap();
    assert_eq!(second.generation, 2);

    // Presenting an already rotated token looks like theft.
    let reused = keyra
        .rotate_refresh(first.refresh_token.expose(), &metadata)
        .await;
    assert_eq!(auth_error(reused), AuthError::ReuseDetected);

    let latest = keyra
        .rotate_refresh(second.refresh_token.expose(), &metadata)
        .await;
    assert_eq!(auth_error(latest), AuthError::FamilyRevoked);
    assert!(!keyra.is_session_active(&login.session.id).await.unwrap());
}

#[tokio::test]
async fn test_unknown_refresh_token() {
    let (keyra, _) = keyra().await;

    let result = keyra
        .rotate_refresh("never-issued", &RequestMetadata::default())
        .await;
    assert_eq!(auth_error(result), AuthError::TokenUnknown);
}

#[tokio::test]
async fn test_revoked_session_cannot_refresh() {
    let (keyra, _) = keyra().await;
    let login = login(&keyra, "revoked@example.com").await;

    keyra.revoke_session(&login.session.id).await.unwrap();
    // Revoking twice is harmless.
    keyra.revoke_session(&login.session.id).await.unwrap();

    let result = keyra
        .rotate_refresh(login.refresh_token.expose(), &RequestMetadata::default())
        .await;
    assert_eq!(auth_error(result), AuthError::FamilyRevoked);
}

#[tokio::test]
async fn test_concurrent_rotation_strict() {
    let (keyra, pool) = keyra().await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "strict@example.com").await;
    let r0 = login.refresh_token.expose();

    let (a, b) = tokio::join!(
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
    );

    let (winner, loser) = match (a, b) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        (a, b) => panic!("expected exactly one successful rotation, got {a:?} and {b:?}"),
    };
    assert!(matches!(
        loser,
        KeyraError::Core(Error::Auth(AuthError::ReuseDetected))
    ));

    // The loser revoked the family, so the winner's token is dead too.
    let after = keyra
        .rotate_refresh(winner.refresh_token.expose(), &metadata)
        .await;
    assert_eq!(auth_error(after), AuthError::FamilyRevoked);

    let (records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM refresh_tokens")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(records, 2);
}

#[tokio::test]
async fn test_concurrent_rotation_within_grace_period() {
    let mut config = KeyraConfig::default();
    config.session.reuse_grace_period = Duration::seconds(30);
    let (keyra, _) = keyra_with(config).await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "grace@example.com").await;
    let r0 = login.refresh_token.expose();

    let (a, b) = tokio::join!(
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
    );

    let (winner, loser) = match (a, b) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        (a, b) => panic!("expected exactly one successful rotation, got {a:?} and {b:?}"),
    };
    assert!(matches!(
        loser,
        KeyraError::Core(Error::Auth(AuthError::ReuseDetected))
    ));

    let next = keyra
        .rotate_refresh(winner.refresh_token.expose(), &metadata)
        .await
        .unwrap();
    assert_eq!(next.generation, 2);
    assert!(keyra.is_session_active(&login.session.id).await.unwrap());
}

#[tokio::test]
async fn test_client_binding_revokes_on_mismatch() {
    let mut config = KeyraConfig::default();
    config.session.bind_client = true;
    let (keyra, _) = keyra_with(config).await;

    let home = RequestMetadata::default().with_ip("198.51.100.1");
    let issued = keyra
        .issue_magic_link("bound@example.com", &home)
        .await
        .unwrap();
    let login = keyra
        .verify_magic_link(issued.token.expose(), &home)
        .await
        .unwrap();

    let elsewhere = RequestMetadata::default().with_ip("192.0.2.99");
    let result = keyra
        .rotate_refresh(login.refresh_token.expose(), &elsewhere)
        .await;
    assert_eq!(auth_error(result), AuthError::ClientMismatch);
    assert!(!keyra.is_session_active(&login.session.id).await.unwrap());
}

#[tokio::test]
async fn test_only_token_hashes_are_persisted() {
    let (keyra, pool) = keyra().await;
    let metadata = RequestMetadata::default();

    let issued = keyra
        .issue_magic_link("hashes@example.com", &metadata)
        .await
        .unwrap();
    let login = keyra
        .verify_magic_link(issued.token.expose(), &metadata)
        .await
        .unwrap();
    let refreshed = keyra
        .rotate_refresh(login.refresh_token.expose(), &metadata)
        .await
        .unwrap();

    let links: Vec<(String,)> = sqlx::query_as("SELECT token_hash FROM magic_links")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(
        links,
        vec![(TokenCodec::hash(issued.token.expose()).as_str().to_string(),)]
    );

    let tokens: Vec<(String,)> =
        sqlx::query_as("SELECT token_hash FROM refresh_tokens ORDER BY generation")
            .fetch_all(&pool)
            .await
            .unwrap();
    let expected: Vec<(String,)> = [&login.refresh_token, &refreshed.refresh_token]
        .into_iter()
        .map(|raw| (raw.hash().as_str().to_string(),))
        .collect();
    assert_eq!(tokens, expected);

    for raw in [
        issued.token.expose(),
        login.refresh_token.expose(),
        refreshed.refresh_token.expose(),
    ] {
        let (hits,): (i64,) = sqlx::query_as(
            r#"
            SELECT (SELECT COUNT(*) FROM magic_links WHERE token_hash = ?1)
                 + (SELECT COUNT(*) FROM refresh_tokens WHERE token_hash = ?1)
                 + (SELECT COUNT(*) FROM refresh_families WHERE current_token_hash = ?1)
                 + (SELECT COUNT(*) FROM audit_logs WHERE details LIKE '%' || ?1 || '%')
            "#,
        )
        .bind(raw)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(hits, 0, "raw token found in storage");
    }
}

#[tokio::test]
async fn test_reuse_is_audited() {
    let (keyra, pool) = keyra().await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "audit@example.com").await;

    keyra
        .rotate_refresh(login.refresh_token.expose(), &metadata)
        .await
        .unwrap();
    let _ = keyra
        .rotate_refresh(login.refresh_token.expose(), &metadata)
        .await;

    let events: Vec<(String,)> = sqlx::query_as("SELECT event FROM audit_logs ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    let events: Vec<String> = events.into_iter().map(|(event,)| event).collect();

    assert!(events.contains(&"session_created".to_string()));
    assert!(events.contains(&"token_rotated".to_string()));
    assert!(events.contains(&"reuse_detected".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rotation_on_shared_database_file() {
    let (_dir, keyra, pool) = file_keyra().await;
    let metadata = RequestMetadata::default();
    let login = login(&keyra, "file@example.com").await;
    let r0 = login.refresh_token.expose();

    let (a, b, c, d, e, f) = tokio::join!(
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
        keyra.rotate_refresh(r0, &metadata),
    );

    let results = [a, b, c, d, e, f];
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(
                    e,
                    KeyraError::Core(Error::Auth(
                        AuthError::ReuseDetected | AuthError::FamilyRevoked
                    ))
                ),
                "unexpected failure: {e:?}"
            );
        }
    }

    let after = keyra
        .rotate_refresh(winners[0].refresh_token.expose(), &metadata)
        .await;
    assert_eq!(auth_error(after), AuthError::FamilyRevoked);

    let (records,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM refresh_tokens")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(records, 2);
}
