#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Team, count, spy_db, sqlite_db, team_count};
use futures_util::FutureExt;
use sql_session::prelude::*;
use tokio::sync::Barrier;

fn explode() -> Result<(), SqlSessionError> {
    panic!("handler blew up")
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_commits_on_ok_and_rolls_back_on_err() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("scope", DefaultSession::PerCall).await?;

    db.scope(|_session| async {
        db.save(vec![Team::new("Kept")], SaveOptions::default())
            .await?;
        Ok::<(), SqlSessionError>(())
    })
    .await?;
    assert_eq!(team_count(&db).await?, 1);

    let failed = db
        .scope(|_session| async {
            db.save(vec![Team::new("Lost")], SaveOptions::default())
                .await?;
            Err::<(), _>(SqlSessionError::Other("handler failed".into()))
        })
        .await;
    assert!(matches!(failed, Err(SqlSessionError::Other(_))));
    assert_eq!(team_count(&db).await?, 1);
    assert!(db.session().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_in_a_scope_share_one_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db, spy) = spy_db("onetx", DefaultSession::PerCall).await?;
    let acquired = count(&spy.acquired);
    let commits = count(&spy.commits);

    db.scope(|session| {
        let db = &db;
        let spy = &spy;
        async move {
            assert!(db.session().is_some_and(|bound| bound.same_as(&session)));
            assert!(db.current()?.same_as(&session));
            db.execute("INSERT INTO teams (name) VALUES ('a')", CallOptions::default())
                .await?;
            let mut saved = db
                .save(vec![Team::new("b")], SaveOptions::default())
                .await?;
            saved[0].name = "b2".into();
            db.save(saved, SaveOptions::default()).await?;
            assert_eq!(count(&spy.commits), commits, "scoped calls leave commit to the scope");
            assert!(session.in_transaction().await);
            Ok::<(), SqlSessionError>(())
        }
    })
    .await?;

    assert_eq!(count(&spy.acquired), acquired + 1);
    assert_eq!(count(&spy.commits), commits + 1);
    assert_eq!(count(&spy.acquired), count(&spy.released));
    assert_eq!(team_count(&db).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_bindings_restore_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("nested", DefaultSession::PerCall).await?;
    let outer = db.new_session();
    let inner = db.new_session();

    db.bind(&outer, async {
        assert!(db.current()?.same_as(&outer));

        let res = db
            .bind(&inner, async {
                assert!(db.current()?.same_as(&inner));
                Err::<(), _>(SqlSessionError::Other("inner failure".into()))
            })
            .await;
        assert!(res.is_err());
        assert!(db.current()?.same_as(&outer), "outer binding is back after the error");

        db.with_binding(SessionBinding::PerCall, async {
            assert!(db.session().is_none());
            assert!(db.is_scoped());
            db.execute("INSERT INTO teams (name) VALUES ('fresh')", CallOptions::default())
                .await
        })
        .await?;
        assert!(!outer.in_transaction().await, "per-call work bypassed the outer session");
        Ok::<(), SqlSessionError>(())
    })
    .await?;

    assert!(db.session().is_none());
    assert!(!db.is_scoped());
    assert_eq!(team_count(&db).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn bindings_stay_with_their_task() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("tasks", DefaultSession::PerCall).await?;
    let barrier = Arc::new(Barrier::new(2));

    let spawn_bound = |db: Database, barrier: Arc<Barrier>| {
        tokio::spawn(async move {
            let mine = db.new_session();
            db.bind(&mine, async {
                barrier.wait().await;
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                    let seen = db.session().is_some_and(|s| s.same_as(&mine));
                    if !seen {
                        return false;
                    }
                }
                barrier.wait().await;
                true
            })
            .await
        })
    };

    let first = spawn_bound(db.clone(), Arc::clone(&barrier));
    let second = spawn_bound(db.clone(), Arc::clone(&barrier));
    assert!(first.await?);
    assert!(second.await?);

    let outer = db.new_session();
    let child_saw_binding = db
        .bind(&outer, {
            let db = db.clone();
            async move { tokio::spawn(async move { db.is_scoped() }).await }
        })
        .await?;
    assert!(!child_saw_binding, "spawned tasks start unbound");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn thread_guard_binds_synchronous_code() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("guard", DefaultSession::PerCall).await?;
    let session = db.new_session();

    let guard = db.enter(&session)?;
    assert!(db.current()?.same_as(&session));
    {
        let inner = db.new_session();
        let _nested = db.enter(&inner)?;
        assert!(db.current()?.same_as(&inner));
    }
    assert!(db.current()?.same_as(&session));
    drop(guard);
    assert!(db.session().is_none());
    assert!(!db.current()?.same_as(&session));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn scope_panic_rolls_back_and_resumes() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("panic", DefaultSession::PerCall).await?;

    let task = tokio::spawn({
        let db = db.clone();
        async move {
            db.scope(|_session| async {
                db.execute("INSERT INTO teams (name) VALUES ('doomed')", CallOptions::default())
                    .await?;
                explode()
            })
            .await
        }
    });
    let joined = task.await;
    let err = joined.err().ok_or("panic expected")?;
    assert!(err.is_panic());
    assert_eq!(team_count(&db).await?, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_shadows_an_enclosing_thread_guard() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("guardbind", DefaultSession::PerCall).await?;
    let outer = db.new_session();
    let inner = db.new_session();

    let _guard = db.enter(&outer)?;
    let seen = db.bind(&inner, async { db.session() }).await;
    assert!(seen.is_some_and(|s| s.same_as(&inner)));
    let seen_per_call = db
        .with_binding(SessionBinding::PerCall, async { db.session() })
        .await;
    assert!(seen_per_call.is_none());
    assert!(db.session().is_some_and(|s| s.same_as(&outer)));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn thread_guards_never_reach_tasks_on_the_same_thread() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("guardtasks", DefaultSession::PerCall).await?;
    let held = db.new_session();
    let _guard = db.enter(&held)?;

    let spawned_sees = tokio::spawn({
        let db = db.clone();
        async move { db.is_scoped() }
    })
    .await?;
    assert!(!spawned_sees);

    let local = tokio::task::LocalSet::new();
    let (refused, other_sees) = local
        .run_until({
            let db = db.clone();
            async move {
                let first = tokio::task::spawn_local({
                    let db = db.clone();
                    async move {
                        let session = db.new_session();
                        let refused = db.enter(&session).is_err();
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        refused
                    }
                });
                let second = tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    db.is_scoped()
                });
                (first.await, second.await)
            }
        })
        .await;
    assert!(refused?, "tasks must bind with Database::bind");
    assert!(!other_sees?);
    assert!(db.session().is_some_and(|s| s.same_as(&held)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shortcut_calls_inside_run_do_not_wait_on_its_session() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("reentrant", DefaultSession::PerCall).await?;

    let nested = db.clone();
    let scoped = tokio::time::timeout(
        Duration::from_secs(5),
        db.scope(|_session| async {
            db.run(
                move |mut ctx| {
                    async move {
                        ctx.execute("INSERT INTO teams (name) VALUES ('Outer')").await?;
                        nested.save(vec![Team::new("Nested")], SaveOptions::default()).await?;
                        Ok::<(), SqlSessionError>(())
                    }
                    .boxed()
                },
                CallOptions::default(),
            )
            .await
        }),
    )
    .await?;
    assert!(matches!(scoped, Err(SqlSessionError::ExecutionError(_))));
    assert_eq!(team_count(&db).await?, 0);

    // Calls on other sessions from inside the closure are fine.
    let explicit = db.new_session();
    let nested = db.clone();
    let other = explicit.clone();
    db.run(
        move |mut ctx| {
            async move {
                ctx.execute("INSERT INTO teams (name) VALUES ('Run')").await?;
                nested.scalar("SELECT 1", CallOptions::default().executor(&other)).await?;
                Ok::<(), SqlSessionError>(())
            }
            .boxed()
        },
        CallOptions::default(),
    )
    .await?;
    explicit.close().await?;
    assert_eq!(team_count(&db).await?, 1);
    Ok(())
}
