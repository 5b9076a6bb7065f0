//! 依赖检查器时序测试

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use keel_bootstrap::DependencyChecker;
use keel_config::DependencyConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct InFlight {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

/// 每个请求等待 `delay` 后返回 200，并记录最大并发
async fn slow_server(delay: Duration) -> (String, InFlight) {
    let in_flight = InFlight::default();
    let app = Router::new()
        .route(
            "/health",
            get(move |State(state): State<InFlight>| async move {
                let now = state.current.fetch_add(1, Ordering::SeqCst) + 1;
                state.max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                state.current.fetch_sub(1, Ordering::SeqCst);
                "ok"
            }),
        )
        .with_state(in_flight.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/health"), in_flight)
}

async fn closed_address() -> String {
    let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    tmp.local_addr().unwrap().to_string()
}

#[tokio::test]
async fn test_run_all_bounded_by_probe_timeout() {
    let (url, _) = slow_server(Duration::from_secs(10)).await;
    let dependencies = (0..6)
        .map(|i| DependencyConfig::http(format!("svc-{i}"), url.clone()))
        .collect();
    let checker = DependencyChecker::new(dependencies, Duration::from_millis(300));

    let started = Instant::now();
    let results = checker.run_all(&CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(results.len(), 6);
    assert!(results.values().all(|r| !r.ok));
    assert!(
        results
            .values()
            .all(|r| r.error.as_deref().unwrap().contains("timed out"))
    );
}

#[tokio::test]
async fn test_run_all_respects_concurrency_limit() {
    let (url, in_flight) = slow_server(Duration::from_millis(100)).await;
    let dependencies = (0..8)
        .map(|i| DependencyConfig::http(format!("svc-{i}"), url.clone()))
        .collect();
    let checker =
        DependencyChecker::new(dependencies, Duration::from_secs(5)).with_concurrency(3);

    let results = checker.run_all(&CancellationToken::new()).await;

    assert_eq!(results.len(), 8);
    assert!(results.values().all(|r| r.ok));
    let max = in_flight.max.load(Ordering::SeqCst);
    assert!(max <= 3, "max in flight was {max}");
}

#[tokio::test]
async fn test_wait_gives_up_after_max_wait() {
    let checker = DependencyChecker::new(
        vec![DependencyConfig::tcp("postgres", closed_address().await).critical()],
        Duration::from_millis(500),
    )
    .with_wait_policy(Duration::from_secs(1), Duration::from_millis(200));

    let started = Instant::now();
    checker
        .wait_for_dependencies(&CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(1) + Duration::from_millis(200) + Duration::from_millis(500));
}

#[tokio::test]
async fn test_wait_bounded_when_critical_dependency_hangs() {
    let (url, _) = slow_server(Duration::from_secs(30)).await;
    let wait = Duration::from_secs(1);
    let poll = Duration::from_millis(200);
    let checker = DependencyChecker::new(
        vec![DependencyConfig::http("slow-api", url).critical()],
        Duration::from_millis(800),
    )
    .with_wait_policy(wait, poll);

    let started = Instant::now();
    checker
        .wait_for_dependencies(&CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= wait);
    assert!(elapsed <= wait + poll, "wait took {elapsed:?}");
}

#[tokio::test]
async fn test_wait_returns_when_cancelled() {
    let checker = DependencyChecker::new(
        vec![DependencyConfig::tcp("postgres", closed_address().await).critical()],
        Duration::from_millis(500),
    )
    .with_wait_policy(Duration::from_secs(30), Duration::from_secs(2));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    checker.wait_for_dependencies(&cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_wait_succeeds_when_critical_dependencies_healthy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().to_string();

    let checker = DependencyChecker::new(
        vec![
            DependencyConfig::tcp("postgres", open).critical(),
            DependencyConfig::tcp("optional", closed_address().await),
        ],
        Duration::from_millis(500),
    )
    .with_wait_policy(Duration::from_secs(30), Duration::from_secs(2));

    let started = Instant::now();
    checker
        .wait_for_dependencies(&CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}
