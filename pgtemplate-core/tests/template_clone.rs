//! Clone/drop behaviour against a real server.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pgtemplate_core::{
    seed_fn, BoxError, Config, Context, Error, ExternalServer, FailureKind, InstanceState,
    SetupStage, TemplateServer,
};
use sqlx::{Connection, Executor, PgConnection};

use common::{count_rows, ctx, start, template_rows};

fn acme_config() -> Config {
    Config::new("acme").with_seed(seed_fn(|conn, _url| {
        Box::pin(async move {
            (&mut *conn)
                .execute("CREATE TABLE t (id SERIAL PRIMARY KEY, label TEXT NOT NULL)")
                .await?;
            (&mut *conn)
                .execute("INSERT INTO t (label) VALUES ('seeded')")
                .await?;
            Ok::<(), BoxError>(())
        })
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn seeded_row_visible_in_every_instance() {
    let server = start(acme_config()).await;
    let ctx = ctx();

    let mut a = server.acquire(&ctx).await.expect("acquire a");
    let mut b = server.acquire(&ctx).await.expect("acquire b");
    assert_eq!(count_rows(a.conn(), "t").await, 1);
    assert_eq!(count_rows(b.conn(), "t").await, 1);

    sqlx::query("INSERT INTO t (label) VALUES ('only in a')")
        .execute(a.conn())
        .await
        .unwrap();
    assert_eq!(count_rows(a.conn(), "t").await, 2);
    assert_eq!(count_rows(b.conn(), "t").await, 1);

    let a_name = a.name().to_string();
    assert!(
        server
            .instances()
            .is_reachable(&a_name, Duration::from_secs(5))
            .await
    );
    server.release(&ctx, a).await.expect("release a");
    assert!(
        !server
            .instances()
            .is_reachable(&a_name, Duration::from_secs(5))
            .await
    );

    // Other instances and the template are untouched.
    assert_eq!(count_rows(b.conn(), "t").await, 1);
    server.release(&ctx, b).await.expect("release b");
    assert_eq!(template_rows(&server, "t").await, 1);

    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires docker"]
async fn concurrent_acquires_get_distinct_databases() {
    const N: usize = 16;
    let server = Arc::new(start(acme_config()).await);

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let server = server.clone();
            tokio::spawn(async move {
                let ctx = ctx();
                let mut instance = server.acquire(&ctx).await.expect("concurrent acquire");
                sqlx::query("INSERT INTO t (label) VALUES ($1)")
                    .bind(format!("task {i}"))
                    .execute(instance.conn())
                    .await
                    .expect("instance must be writable");
                let rows = count_rows(instance.conn(), "t").await;
                (instance, rows)
            })
        })
        .collect();

    let mut instances = Vec::with_capacity(N);
    for handle in handles {
        let (instance, rows) = handle.await.expect("task panicked");
        // Seeded row plus this task's own insert, nothing from the others.
        assert_eq!(rows, 2);
        instances.push(instance);
    }

    let names: HashSet<String> = instances.iter().map(|i| i.name().to_string()).collect();
    assert_eq!(names.len(), N);

    let listed: HashSet<String> = server
        .list_clones(&ctx())
        .await
        .expect("list clones")
        .into_iter()
        .collect();
    assert_eq!(listed, names);

    for instance in instances {
        server.release(&ctx(), instance).await.expect("release");
    }
    assert!(server.list_clones(&ctx()).await.unwrap().is_empty());

    let server = Arc::try_unwrap(server).ok().expect("no other owners");
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn template_survives_many_clone_cycles() {
    let server = start(acme_config()).await;
    assert_eq!(template_rows(&server, "t").await, 1);

    let ctx = Context::background();
    for _ in 0..1000 {
        let mut instance = server.acquire(&ctx).await.expect("acquire");
        sqlx::query("DELETE FROM t").execute(instance.conn()).await.unwrap();
        server.release(&ctx, instance).await.expect("release");
    }

    assert_eq!(template_rows(&server, "t").await, 1);
    assert!(server.list_clones(&ctx).await.unwrap().is_empty());
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn cancelled_wait_returns_promptly_and_leaves_gate_usable() {
    let server = start(Config::new("acme")).await;

    let lease = server
        .instances()
        .gate()
        .acquire(&Context::background())
        .await
        .expect("hold the gate");

    let started = Instant::now();
    let err = server
        .acquire(&Context::with_timeout(Duration::from_millis(200)))
        .await
        .expect_err("gate is held");
    assert!(matches!(err, Error::ContextEnded { .. }));
    assert_eq!(err.kind(), FailureKind::Acquire);
    assert!(started.elapsed() < Duration::from_secs(2));

    let (cancel_ctx, handle) = Context::with_cancel();
    let waiter = tokio::spawn({
        let cancel_ctx = cancel_ctx.clone();
        async move { cancel_ctx.done().await }
    });
    handle.cancel();
    waiter.await.unwrap();
    let err = server.acquire(&cancel_ctx).await.expect_err("cancelled");
    assert!(matches!(err, Error::ContextEnded { .. }));

    // Nothing was created while waiting.
    drop(lease);
    assert!(server.list_clones(&ctx()).await.unwrap().is_empty());

    let instance = server.acquire(&ctx()).await.expect("gate still works");
    server.release(&ctx(), instance).await.expect("release");
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn failed_clone_does_not_block_later_callers() {
    let server = start(Config::new("acme")).await;

    // A session on the template makes CREATE DATABASE ... TEMPLATE fail.
    let blocker = PgConnection::connect(&server.template_url())
        .await
        .expect("connect to template");
    let err = server.acquire(&ctx()).await.expect_err("template is busy");
    assert!(matches!(err, Error::Clone { .. }));
    assert_eq!(err.kind(), FailureKind::Acquire);

    blocker.close().await.unwrap();
    let instance = server.acquire(&ctx()).await.expect("acquire after failure");
    server.release(&ctx(), instance).await.expect("release");
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn drop_orphan_refuses_template_and_strangers() {
    let server = start(Config::new("acme")).await;
    let ctx = ctx();

    let err = server.drop_orphan(&ctx, "acme").await.unwrap_err();
    assert!(matches!(err, Error::ProtectedDatabase { .. }));
    let err = server.drop_orphan(&ctx, "postgres").await.unwrap_err();
    assert!(matches!(err, Error::ProtectedDatabase { .. }));

    let instance = server.acquire(&ctx).await.expect("acquire");
    let name = instance.name().to_string();
    // A caller that lost the instance without releasing it.
    drop(instance);
    assert_eq!(server.list_clones(&ctx).await.unwrap(), vec![name.clone()]);

    server.drop_orphan(&ctx, &name).await.expect("drop orphan");
    assert!(server.list_clones(&ctx).await.unwrap().is_empty());
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn shutdown_makes_server_unreachable() {
    let server: TemplateServer = start(Config::new("acme")).await;
    let url = server.template_url();
    server.shutdown().await.expect("shutdown");

    let attempt = tokio::time::timeout(
        Duration::from_secs(5),
        PgConnection::connect(&url),
    )
    .await;
    assert!(!matches!(attempt, Ok(Ok(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn external_server_owns_only_its_template() {
    let host = start(Config::new("host_db")).await;
    let external = ExternalServer::new(host.endpoint().clone());

    let config = Config::new("ext").with_seed(seed_fn(|conn, _url| {
        Box::pin(async move {
            (&mut *conn)
                .execute("CREATE TABLE t (id INT); INSERT INTO t VALUES (1)")
                .await?;
            Ok::<(), BoxError>(())
        })
    }));
    let server = TemplateServer::start_with(config, &external)
        .await
        .expect("start on external server");

    let mut instance = server.acquire(&ctx()).await.expect("acquire");
    assert_eq!(count_rows(instance.conn(), "t").await, 1);
    server.release(&ctx(), instance).await.expect("release");
    server.shutdown().await.expect("shutdown");

    // The template is gone, the borrowed server and its own template are not.
    let mut admin = PgConnection::connect(&host.endpoint().url("postgres"))
        .await
        .expect("host server still up");
    let names: Vec<String> = sqlx::query_scalar("SELECT datname FROM pg_database ORDER BY datname")
        .fetch_all(&mut admin)
        .await
        .unwrap();
    assert!(!names.iter().any(|n| n.starts_with("ext")));
    assert!(names.contains(&"host_db".to_string()));
    admin.close().await.unwrap();

    host.shutdown().await.expect("shutdown host");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn release_with_ended_context_reports_leak() {
    let server = start(Config::new("acme")).await;

    let instance = server.acquire(&ctx()).await.expect("acquire");
    let name = instance.name().to_string();

    let err = server
        .release(&Context::with_timeout(Duration::ZERO), instance)
        .await
        .expect_err("ended context cannot drop");
    assert_eq!(err.kind(), FailureKind::Release);
    assert_eq!(err.orphaned_database(), Some(name.as_str()));

    let Error::Release(release) = &err else {
        panic!("expected a release error, got {err:?}");
    };
    assert_eq!(release.name(), name);
    assert_eq!(release.state(), InstanceState::Leaked);
    // The close handshake was abandoned, not attempted past the deadline.
    assert!(release.close_error().is_some());
    assert!(matches!(
        release.drop_error(),
        Some(Error::ContextEnded { .. })
    ));

    assert_eq!(server.list_clones(&ctx()).await.unwrap(), vec![name.clone()]);
    server.drop_orphan(&ctx(), &name).await.expect("drop leaked clone");
    assert!(server.list_clones(&ctx()).await.unwrap().is_empty());
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn background_wait_outlasts_pool_timeout() {
    let mut config = Config::new("acme");
    config.gate_wait_warning = Duration::from_millis(200);
    let server = Arc::new(start(config).await);

    let lease = server
        .instances()
        .gate()
        .acquire(&Context::background())
        .await
        .expect("hold the gate");

    let waiter = tokio::spawn({
        let server = server.clone();
        async move { server.acquire(&Context::background()).await }
    });

    // Several pool timeouts pass while the gate is held.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished());

    drop(lease);
    let instance = waiter
        .await
        .expect("task panicked")
        .expect("acquire once the gate frees");
    server.release(&ctx(), instance).await.expect("release");

    let server = Arc::try_unwrap(server).ok().expect("no other owners");
    server.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn external_server_refuses_to_drop_foreign_database() {
    let host = start(Config::new("host_db")).await;
    let mut admin = PgConnection::connect(&host.endpoint().url("postgres"))
        .await
        .expect("connect to host");
    (&mut admin).execute("CREATE DATABASE app_data").await.unwrap();
    (&mut admin).execute("CREATE DATABASE stale_tpl").await.unwrap();
    (&mut admin)
        .execute("ALTER DATABASE stale_tpl WITH is_template = true")
        .await
        .unwrap();

    let external = ExternalServer::new(host.endpoint().clone());

    let err = TemplateServer::start_with(Config::new("app_data"), &external)
        .await
        .err()
        .expect("existing non-template database must be refused");
    assert!(matches!(
        err,
        Error::Setup {
            stage: SetupStage::StartingServer,
            ..
        }
    ));
    assert!(err.to_string().contains("not a template"));

    // A template left by an earlier run is replaced.
    let server = TemplateServer::start_with(Config::new("stale_tpl"), &external)
        .await
        .expect("leftover template is recreated");
    server.shutdown().await.expect("shutdown");

    let names: Vec<String> = sqlx::query_scalar("SELECT datname FROM pg_database")
        .fetch_all(&mut admin)
        .await
        .unwrap();
    assert!(names.contains(&"app_data".to_string()));
    assert!(!names.contains(&"stale_tpl".to_string()));
    admin.close().await.unwrap();

    host.shutdown().await.expect("shutdown host");
}
