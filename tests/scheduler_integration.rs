//! Scheduler behavior under load: concurrency cap, pause/resume yield,
//! claim exclusivity, shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediafetch_core::history::HistoryFilter;
use mediafetch_core::postprocess::PostProcessor;
use mediafetch_core::{
    Config, Core, Database, DownloadOptions, HistoryStore, QueueManager, QueueStatus, Scheduler,
    build_default_extractor_registry, engine::HttpEngine,
};
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn build_core(max_concurrent: usize) -> Arc<Core> {
    let db = Database::open_in_memory().await.unwrap();
    let client = reqwest::Client::new();
    let config = Config {
        max_concurrent_downloads: max_concurrent,
        allow_local_network: true,
        ..Config::default()
    };
    let mut engines = mediafetch_core::EngineRegistry::new();
    engines.register(Box::new(HttpEngine::new(client.clone())));
    Arc::new(Core::new(
        Arc::new(QueueManager::new(0)),
        Arc::new(HistoryStore::new(db)),
        Arc::new(build_default_extractor_registry(client)),
        Arc::new(engines),
        Arc::new(PostProcessor::with_binary(None)),
        config,
    ))
}

fn options_for(dir: &Path) -> DownloadOptions {
    DownloadOptions {
        output_dir: dir.to_path_buf(),
        ..DownloadOptions::default()
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn active_count_never_exceeds_max_concurrency() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 64 * 1024])
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(2).await;
    for i in 0..6 {
        core.queue
            .add(
                format!("{}/file-{i}.bin", server.uri()),
                options_for(out.path()),
                None,
            )
            .unwrap();
    }

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;

    let mut max_observed_active = 0usize;
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let stats = core.queue.statistics();
        let active = stats.allocating + stats.downloading + stats.processing;
        max_observed_active = max_observed_active.max(active);
        assert!(
            scheduler.active_count() <= 2,
            "worker count exceeded the cap"
        );
        assert!(active <= 2, "active statuses exceeded the cap: {stats:?}");
        if stats.completed + stats.errors == 6 {
            break;
        }
        assert!(Instant::now() < deadline, "queue never drained: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    scheduler.shutdown(Duration::from_secs(2)).await;

    assert!(
        max_observed_active >= 2,
        "concurrency never reached the cap; the test saw no parallelism"
    );
    assert_eq!(core.queue.statistics().completed, 6);
}

#[tokio::test]
async fn each_item_claimed_exactly_once_under_parallel_drain() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(4).await;
    for i in 0..20 {
        core.queue
            .add(
                format!("{}/item-{i}.bin", server.uri()),
                options_for(out.path()),
                None,
            )
            .unwrap();
    }

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    let queue = Arc::clone(&core.queue);
    assert!(
        wait_until(
            move || queue.statistics().completed == 20,
            Duration::from_secs(30)
        )
        .await,
        "drain stalled: {:?}",
        core.queue.statistics()
    );
    scheduler.shutdown(Duration::from_secs(2)).await;

    // One history row per item; a double claim would duplicate a URL.
    let rows = core
        .history
        .list(0, 0, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 20);
    let mut urls: Vec<String> = rows.into_iter().map(|r| r.url).collect();
    urls.sort();
    urls.dedup();
    assert_eq!(urls.len(), 20, "a URL was processed twice");
}

#[tokio::test]
async fn pause_all_yields_running_item_and_resume_finishes_it() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![9u8; 32 * 1024])
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(1).await;
    let id = core
        .queue
        .add(
            format!("{}/slow.bin", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;

    let queue = Arc::clone(&core.queue);
    assert!(
        wait_until(
            move || queue.get(id).map(|i| i.status) == Some(QueueStatus::Downloading),
            Duration::from_secs(5)
        )
        .await
    );

    // Pause while the engine is waiting on the delayed response; it must
    // yield its slot instead of blocking mid-transfer.
    scheduler.pause_all();
    let queue = Arc::clone(&core.queue);
    assert!(
        wait_until(
            move || queue.get(id).map(|i| i.status) == Some(QueueStatus::Paused),
            Duration::from_secs(5)
        )
        .await,
        "running item did not yield to Paused: {:?}",
        core.queue.get(id)
    );
    // The worker releases its slot right after parking the item.
    let sched_ref = &scheduler;
    assert!(
        wait_until(|| sched_ref.active_count() == 0, Duration::from_secs(2)).await,
        "paused item still holds a slot"
    );

    scheduler.resume_all();
    let queue = Arc::clone(&core.queue);
    assert!(
        wait_until(
            move || queue.get(id).map(|i| i.status) == Some(QueueStatus::Completed),
            Duration::from_secs(15)
        )
        .await,
        "resumed item did not complete: {:?}",
        core.queue.get(id)
    );
    scheduler.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_cancels_in_flight_and_pending_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1024])
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(1).await;
    let running = core
        .queue
        .add(
            format!("{}/a.bin", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();
    let pending = core
        .queue
        .add(
            format!("{}/b.bin", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    let queue = Arc::clone(&core.queue);
    assert!(
        wait_until(
            move || queue.get(running).map(|i| i.status) == Some(QueueStatus::Downloading),
            Duration::from_secs(5)
        )
        .await
    );

    scheduler.shutdown(Duration::from_secs(5)).await;

    let stats = core.queue.statistics();
    assert_eq!(stats.cancelled, 2, "both items should be cancelled: {stats:?}");
    assert_eq!(
        core.queue.get(pending).unwrap().status,
        QueueStatus::Cancelled
    );
    assert_eq!(scheduler.active_count(), 0);
}
