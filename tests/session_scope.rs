mod common;

use std::sync::Arc;

use anyhow::Result;

use anon_session::config::MaskingPolicy;
use anon_session::db::{PinnedConnection, SessionConnection};
use anon_session::errors::MaskingError;
use anon_session::masking::{
    with_database_role, with_masked_session, RoleRegistry, RoleSwitcher, ScopeBuilder, ScopePhase, SessionScope,
};

use common::{settle, FakeConnection, FakeSource};

#[tokio::test]
async fn masked_session_creates_role_once_and_leaves_connection_clean() -> Result<()> {
    let conn = FakeConnection::new();
    let source = FakeSource::new(&conn);
    let policy = MaskingPolicy::new().enabled(true);

    let seen = with_masked_session(&source, &policy, |session| async move {
        let mut guard = session.connection.lock().await;
        let seen = guard.query_one("SELECT current_user::text").await;
        seen
    })
    .await??;

    assert_eq!(seen.as_deref(), Some("masked_reader"));
    assert_eq!(conn.count("CREATE ROLE"), 1);
    assert_eq!(conn.count("SET ROLE"), 1);
    assert_eq!(conn.current_role(), None);
    assert_eq!(conn.search_path(), None);

    // Second run finds the role and does not create it again.
    with_masked_session(&source, &policy, |_| async {}).await?;
    assert_eq!(conn.count("CREATE ROLE"), 1);
    assert_eq!(conn.current_role(), None);
    Ok(())
}

#[tokio::test]
async fn masked_session_routes_search_path_while_active() -> Result<()> {
    let conn = FakeConnection::new().with_role("masked_reader");
    let source = FakeSource::new(&conn);
    let policy = MaskingPolicy::new().with_mask_search_path(Some("mask, public".to_string()));

    let inside = with_masked_session(&source, &policy, |_| {
        let conn = conn.clone();
        async move { conn.search_path() }
    })
    .await?;

    assert_eq!(inside.as_deref(), Some("mask, public"));
    assert_eq!(conn.search_path(), None);
    assert_eq!(conn.count("RESET search_path"), 1);
    Ok(())
}

#[tokio::test]
async fn database_role_requires_existing_role() {
    let conn = FakeConnection::new();
    let source = FakeSource::new(&conn);

    let err = with_database_role(&source, "reporting", |_| async { unreachable!("work must not run") })
        .await
        .unwrap_err();

    assert_eq!(
        err,
        MaskingError::role_switch_failed("reporting", "role does not exist")
    );
    assert_eq!(conn.count("CREATE ROLE"), 0);
    assert_eq!(conn.count("RESET ROLE"), 0);
    assert_eq!(conn.current_role(), None);
}

#[tokio::test]
async fn database_role_switches_to_existing_role_and_back() -> Result<()> {
    let conn = FakeConnection::new().with_role("reporting");
    let source = FakeSource::new(&conn);

    let role = with_database_role(&source, "reporting", |session| {
        let conn = conn.clone();
        async move {
            assert_eq!(conn.current_role().as_deref(), Some("reporting"));
            session.role
        }
    })
    .await?;

    assert_eq!(role, "reporting");
    assert_eq!(conn.current_role(), None);
    assert_eq!(conn.count("RESET search_path"), 1);
    Ok(())
}

#[tokio::test]
async fn unsafe_role_name_never_reaches_the_database() {
    let conn = FakeConnection::new();
    let source = FakeSource::new(&conn);

    let result = ScopeBuilder::role("x\"; DROP ROLE app; --")
        .auto_create(true)
        .run(&source, |_| async {})
        .await;

    assert!(result.is_err());
    assert!(conn.log().iter().all(|sql| !sql.contains("DROP")));
}

#[tokio::test]
async fn nested_scope_restores_outer_role() -> Result<()> {
    let conn = FakeConnection::new().with_role("outer_role").with_role("inner_role");
    let pinned = PinnedConnection::new(conn.clone());

    let mut outer = SessionScope::new(pinned.clone(), RoleSwitcher::new());
    outer.enter("outer_role", false, None).await?;

    ScopeBuilder::role("inner_role")
        .run_on(pinned.clone(), |_| {
            let conn = conn.clone();
            async move { assert_eq!(conn.current_role().as_deref(), Some("inner_role")) }
        })
        .await?;
    assert_eq!(conn.current_role().as_deref(), Some("outer_role"));

    outer.exit().await;
    assert_eq!(outer.phase(), ScopePhase::Idle);
    assert_eq!(conn.current_role(), None);
    Ok(())
}

#[tokio::test]
async fn panicking_work_still_resets_the_role() {
    let conn = FakeConnection::new().with_role("masked_reader");
    let source = FakeSource::new(&conn);

    let handle = tokio::spawn({
        let source = source.clone();
        async move {
            let policy = MaskingPolicy::new();
            with_masked_session(&source, &policy, |_| async {
                panic!("handler blew up");
            })
            .await
        }
    });

    assert!(handle.await.is_err());
    settle().await;

    assert_eq!(conn.current_role(), None);
    assert_eq!(conn.count("RESET ROLE"), 1);
}

#[tokio::test]
async fn cancelled_scope_is_restored_in_the_background() {
    let conn = FakeConnection::new().with_role("masked_reader");
    let source = FakeSource::new(&conn);
    let registry = Arc::new(RoleRegistry::new());

    let handle = tokio::spawn({
        let source = source.clone();
        let registry = Arc::clone(&registry);
        async move {
            ScopeBuilder::masked(&MaskingPolicy::new())
                .registry(registry)
                .run(&source, |_| std::future::pending::<()>())
                .await
        }
    });

    while conn.current_role().is_none() {
        tokio::task::yield_now().await;
    }
    handle.abort();
    let _ = handle.await;
    settle().await;

    assert_eq!(conn.current_role(), None);
    assert!(registry.is_applied("masked_reader"));
}
