//! End-to-end scenarios: queue → scheduler → engine → history.
//!
//! These run the real pipeline against a local mock server. The tests that
//! talk to the server opt into local-network targets through configuration;
//! the SSRF test runs with the default (strict) policy.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use mediafetch_core::history::HistoryFilter;
use mediafetch_core::postprocess::PostProcessor;
use mediafetch_core::{
    Config, Core, Database, DownloadOptions, ErrorKind, HistoryStatus, HistoryStore, QueueEvent,
    QueueManager, QueueStatus, Scheduler, build_default_extractor_registry,
};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn build_core(allow_local: bool, max_concurrent: usize) -> Arc<Core> {
    let db = Database::open_in_memory().await.unwrap();
    let client = reqwest::Client::new();
    let config = Config {
        max_concurrent_downloads: max_concurrent,
        allow_local_network: allow_local,
        ..Config::default()
    };
    Arc::new(Core::new(
        Arc::new(QueueManager::new(0)),
        Arc::new(HistoryStore::new(db)),
        Arc::new(build_default_extractor_registry(client.clone())),
        // No external accelerator in tests; the HTTP engine is the point.
        Arc::new({
            let mut registry = mediafetch_core::EngineRegistry::new();
            registry.register(Box::new(mediafetch_core::engine::HttpEngine::new(client)));
            registry
        }),
        Arc::new(PostProcessor::with_binary(None)),
        config,
    ))
}

async fn wait_for_status(
    queue: &QueueManager,
    id: u64,
    status: QueueStatus,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if queue.get(id).map(|i| i.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn options_for(dir: &Path) -> DownloadOptions {
    DownloadOptions {
        output_dir: dir.to_path_buf(),
        ..DownloadOptions::default()
    }
}

#[tokio::test]
async fn happy_path_downloads_file_and_records_history() {
    let server = MockServer::start().await;
    let body = vec![0xAB; 1_048_576];
    Mock::given(method("GET"))
        .and(path("/a.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Length", "1048576"))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(true, 1).await;

    // Record the status path as listeners see it.
    let transitions: Arc<std::sync::Mutex<Vec<(QueueStatus, QueueStatus)>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    core.queue.subscribe(Arc::new(move |event| {
        if let QueueEvent::Changed { from, to, .. } = event
            && from != to
        {
            sink.lock().unwrap().push((*from, *to));
        }
    }));

    let id = core
        .queue
        .add(
            format!("{}/a.mp4", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;

    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Completed, Duration::from_secs(10)).await,
        "item never completed: {:?}",
        core.queue.get(id)
    );
    scheduler.shutdown(Duration::from_secs(5)).await;

    let item = core.queue.get(id).unwrap();
    let saved = item.filepath.clone().unwrap();
    assert_eq!(std::fs::metadata(&saved).unwrap().len(), 1_048_576);
    assert!(saved.starts_with(out.path().canonicalize().unwrap()));
    assert!((item.progress.ratio - 1.0).abs() < 1e-9);

    let observed = transitions.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![
            (QueueStatus::Queued, QueueStatus::Allocating),
            (QueueStatus::Allocating, QueueStatus::Downloading),
            (QueueStatus::Downloading, QueueStatus::Processing),
            (QueueStatus::Processing, QueueStatus::Completed),
        ]
    );

    let rows = core
        .history
        .list(0, 0, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status(), HistoryStatus::Completed);
    assert_eq!(rows[0].size_bytes, Some(1_048_576));
}

#[tokio::test]
async fn ssrf_target_fails_fast_without_network() {
    let out = TempDir::new().unwrap();
    // Strict default policy.
    let core = build_core(false, 1).await;

    let id = core
        .queue
        .add(
            "http://192.168.0.5/a.bin".to_string(),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Error, Duration::from_secs(5)).await
    );
    scheduler.shutdown(Duration::from_secs(2)).await;

    let item = core.queue.get(id).unwrap();
    let message = item.error_message.unwrap();
    assert!(
        message.contains("security"),
        "expected a security error, got: {message}"
    );

    let rows = core
        .history
        .list(0, 0, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status(), HistoryStatus::Error);
}

#[tokio::test]
async fn traversal_filename_from_server_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/attach"))
        .respond_with(ResponseTemplate::new(200).insert_header(
            "Content-Disposition",
            "attachment; filename=\"../../etc/passwd\"",
        ))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(true, 1).await;
    let id = core
        .queue
        .add(
            format!("{}/attach", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Error, Duration::from_secs(5)).await
    );
    scheduler.shutdown(Duration::from_secs(2)).await;

    // Nothing escaped the output directory, and nothing was written at all.
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn cancel_mid_download_reaches_cancelled_quickly() {
    let server = MockServer::start().await;
    // 100 MB claimed, trickled with a delay so the transfer is in flight
    // long enough to cancel.
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Length", "104857600")
                .set_body_bytes(vec![0u8; 8 * 1024 * 1024])
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(true, 1).await;
    let id = core
        .queue
        .add(
            format!("{}/big.bin", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Downloading, Duration::from_secs(5)).await
    );

    let cancelled_at = Instant::now();
    scheduler.cancel_item(id);
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Cancelled, Duration::from_secs(2)).await,
        "cancel not observed within 2s"
    );
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    scheduler.shutdown(Duration::from_secs(2)).await;

    // Terminal status is immutable afterwards.
    let item = core.queue.get(id).unwrap();
    assert_eq!(item.status, QueueStatus::Cancelled);

    let rows = core
        .history
        .list(0, 0, &HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status(), HistoryStatus::Cancelled);
}

#[tokio::test]
async fn retry_resumes_partial_with_range() {
    let server = MockServer::start().await;
    let full: Vec<u8> = (0..10u8).cycle().take(10 * 1024).collect();
    let split = 4 * 1024;

    Mock::given(method("HEAD"))
        .and(path("/resumable.bin"))
        .respond_with(ResponseTemplate::new(200).insert_header("Accept-Ranges", "bytes"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/resumable.bin"))
        .and(header("Range", format!("bytes={split}-").as_str()))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(full[split..].to_vec()))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    // A previous attempt left the first 4 KiB banked.
    std::fs::write(out.path().join("resumable.bin.part"), &full[..split]).unwrap();

    let core = build_core(true, 1).await;
    let id = core
        .queue
        .add(
            format!("{}/resumable.bin", server.uri()),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Completed, Duration::from_secs(10)).await,
        "resume run did not complete: {:?}",
        core.queue.get(id)
    );
    scheduler.shutdown(Duration::from_secs(2)).await;

    let item = core.queue.get(id).unwrap();
    let saved = item.filepath.unwrap();
    assert_eq!(std::fs::read(&saved).unwrap(), full);
    assert!((item.progress.ratio - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn scheduled_item_waits_then_downloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/later.mp4"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let out = TempDir::new().unwrap();
    let core = build_core(true, 1).await;
    let start_at = SystemTime::now() + Duration::from_secs(2);
    let id = core
        .queue
        .add(
            format!("{}/later.mp4", server.uri()),
            options_for(out.path()),
            Some(start_at),
        )
        .unwrap();
    assert_eq!(core.queue.get(id).unwrap().status, QueueStatus::Scheduled);

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;

    // Still scheduled well before the start time.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(core.queue.get(id).unwrap().status, QueueStatus::Scheduled);

    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Completed, Duration::from_secs(10)).await
    );
    scheduler.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn queue_level_retry_produces_fresh_attempt() {
    let out = TempDir::new().unwrap();
    let core = build_core(false, 1).await;

    // Guaranteed failure: SSRF-blocked target under strict policy.
    let id = core
        .queue
        .add(
            "http://10.0.0.9/x.bin".to_string(),
            options_for(out.path()),
            None,
        )
        .unwrap();

    let scheduler = Scheduler::new(Arc::clone(&core));
    scheduler.start().await;
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Error, Duration::from_secs(5)).await
    );

    core.queue.retry_item(id).unwrap();
    let item = core.queue.get(id).unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.progress.ratio, 0.0);

    // The retry fails the same way; retry_count sticks.
    assert!(
        wait_for_status(&core.queue, id, QueueStatus::Error, Duration::from_secs(5)).await
    );
    assert_eq!(core.queue.get(id).unwrap().retry_count, 1);
    scheduler.shutdown(Duration::from_secs(2)).await;

    let err = mediafetch_core::CoreError::security("x");
    assert_eq!(err.kind(), ErrorKind::Security);
}
