#![cfg(feature = "sqlite")]

mod common;

use common::{Team, sqlite_db, team_count};
use sql_session::prelude::*;
use tokio::sync::oneshot;

#[derive(Debug)]
struct Status(u16);

impl RequestOutcome for Status {
    fn should_commit(&self) -> bool {
        self.0 < 400
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn response_status_decides_commit() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("status", DefaultSession::PerCall).await?;
    let scope = RequestScope::new(&db);

    let insert = |name: &'static str, status: u16| {
        let db = db.clone();
        move |_req: ()| async move {
            let saved = db.save(vec![Team::new(name)], SaveOptions::default()).await;
            match saved {
                Ok(_) => Status(status),
                Err(_) => Status(500),
            }
        }
    };

    let ok = scope.dispatch((), insert("kept", 201)).await?;
    assert_eq!(ok.0, 201);
    let bad = scope.dispatch((), insert("dropped", 422)).await?;
    assert_eq!(bad.0, 422);
    assert_eq!(team_count(&db).await?, 1);

    let manual = RequestScope::new(&db).commit_on_success(false);
    manual.dispatch((), insert("manual", 200)).await?;
    assert_eq!(team_count(&db).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn result_responses_commit_only_on_ok() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("result", DefaultSession::PerCall).await?;
    let scope = RequestScope::new(&db);

    let response: Result<String, SqlSessionError> = scope
        .dispatch("POST /teams", |req| { let db = &db; async move {
            db.execute("INSERT INTO teams (name) VALUES ('posted')", CallOptions::default())
                .await?;
            Ok::<_, SqlSessionError>(format!("handled {req}"))
        }})
        .await?;
    assert_eq!(response?, "handled POST /teams");

    let response: Result<(), SqlSessionError> = scope
        .dispatch("POST /teams", |_req| async {
            db.execute("INSERT INTO teams (name) VALUES ('rejected')", CallOptions::default())
                .await?;
            Err::<(), _>(SqlSessionError::Other("validation failed".into()))
        })
        .await?;
    assert!(response.is_err());
    assert_eq!(team_count(&db).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_dispatch_joins_the_outer_request() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("mounted", DefaultSession::PerCall).await?;
    let scope = RequestScope::new(&db);

    let outcome: Result<(), SqlSessionError> = scope
        .dispatch((), |()| async {
            let outer = db.session().ok_or_else(|| SqlSessionError::Other("unbound".into()))?;
            let inner: Result<(), SqlSessionError> = scope
                .dispatch((), |()| async {
                    let mounted = db.session();
                    assert!(mounted.is_some_and(|s| s.same_as(&outer)));
                    db.execute("INSERT INTO teams (name) VALUES ('sub-app')", CallOptions::default())
                        .await?;
                    Err::<(), _>(SqlSessionError::Other("sub-app error".into()))
                })
                .await?;
            assert!(inner.is_err());
            assert!(outer.in_transaction().await, "inner failure did not end the request");
            Ok::<(), SqlSessionError>(())
        })
        .await?;
    assert!(outcome.is_ok());
    assert_eq!(team_count(&db).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("isolation", DefaultSession::PerCall).await?;
    let (a_wrote_tx, a_wrote_rx) = oneshot::channel::<()>();
    let (b_read_tx, b_read_rx) = oneshot::channel::<()>();

    let request_a = tokio::spawn({
        let db = db.clone();
        async move {
            let scope = RequestScope::new(&db);
            scope
                .dispatch((), |()| async {
                    db.save(vec![Team::with_id(1001, "A")], SaveOptions::default())
                        .await?;
                    let _ = a_wrote_tx.send(());
                    let _ = b_read_rx.await;

                    let own: Option<Team> = db.get(1001_i64).await?;
                    let other: Option<Team> = db.get(2002_i64).await?;
                    Ok::<_, SqlSessionError>((own.is_some(), other.is_some()))
                })
                .await?
        }
    });

    let request_b = tokio::spawn({
        let db = db.clone();
        async move {
            let _ = a_wrote_rx.await;
            let scope = RequestScope::new(&db);
            scope
                .dispatch((), |()| async {
                    let peek: Option<Team> = db.get(1001_i64).await?;
                    let _ = b_read_tx.send(());
                    // Waits on A's write lock until A's request commits.
                    db.save(vec![Team::with_id(2002, "B")], SaveOptions::default())
                        .await?;
                    let own: Option<Team> = db.get(2002_i64).await?;
                    Ok::<_, SqlSessionError>((peek.is_some(), own.is_some()))
                })
                .await?
        }
    });

    let (a_sees_own, a_sees_b) = request_a.await??;
    let (b_sees_a, b_sees_own) = request_b.await??;
    assert!(a_sees_own);
    assert!(!a_sees_b);
    assert!(!b_sees_a, "uncommitted work leaked across requests");
    assert!(b_sees_own);
    assert_eq!(team_count(&db).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_panic_propagates_after_cleanup() -> Result<(), Box<dyn std::error::Error>> {
    let (_dir, db) = sqlite_db("reqpanic", DefaultSession::PerCall).await?;

    let task = tokio::spawn({
        let db = db.clone();
        async move {
            RequestScope::new(&db)
                .dispatch((), |()| async {
                    db.execute("INSERT INTO teams (name) VALUES ('doomed')", CallOptions::default())
                        .await?;
                    if db.is_scoped() {
                        panic!("handler blew up");
                    }
                    Ok::<(), SqlSessionError>(())
                })
                .await
        }
    });
    let err = task.await.err().ok_or("panic expected")?;
    assert!(err.is_panic());
    assert_eq!(team_count(&db).await?, 0);
    Ok(())
}
