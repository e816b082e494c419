// tests/orchestrator_test.rs

use signage_sync::client::RobustClient;
use signage_sync::config::AppConfig;
use signage_sync::downloader::{DownloadOrchestrator, ProgressSnapshot};
use signage_sync::models::{DownloadProgress, DownloadRequest, Priority};
use signage_sync::storage::{CacheLimits, SpaceProbe, StorageCache};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// 最小的 MP4 文件头，足以通过文件签名校验
const MP4_BYTES: &[u8] = b"\x00\x00\x00\x18ftypisom\x00\x00\x02\x00isomiso2";

struct FixedSpace(u64);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

struct Harness {
    _dir: TempDir,
    cache: Arc<StorageCache>,
    orchestrator: DownloadOrchestrator,
}

fn harness(max_attempts: u32, free_bytes: u64) -> Harness {
    harness_with(free_bytes, |c| c.max_attempts = max_attempts)
}

fn harness_with(free_bytes: u64, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempdir().unwrap();
    let mut config = AppConfig {
        cache_dir: dir.path().to_path_buf(),
        retry_step: Duration::from_millis(10),
        drain_interval: Duration::from_millis(50),
        ..Default::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);
    let cache = Arc::new(
        StorageCache::new(dir.path(), config.cache_limits.clone())
            .unwrap()
            .with_space_probe(Arc::new(FixedSpace(free_bytes))),
    );
    let client = RobustClient::new(&config).unwrap();
    let orchestrator = DownloadOrchestrator::new(config, cache.clone(), client.download);
    Harness {
        _dir: dir,
        cache,
        orchestrator,
    }
}

fn small_cache(max_cache_bytes: u64) -> CacheLimits {
    CacheLimits {
        max_cache_bytes,
        min_free_bytes: 0,
        ..CacheLimits::default()
    }
}

const PLENTY: u64 = 100 * 1024 * 1024 * 1024;

/// 等待某个 URL 进入终态
async fn wait_terminal(orchestrator: &DownloadOrchestrator, url: &str) -> DownloadProgress {
    let mut rx = orchestrator.subscribe();
    let wait = async {
        loop {
            if let Some(p) = rx.borrow_and_update().get(url)
                && p.is_terminal()
            {
                return p.clone();
            }
            rx.changed().await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(15), wait)
        .await
        .expect("download did not settle in time")
}

/// 等待进度表满足条件
async fn wait_until(
    orchestrator: &DownloadOrchestrator,
    what: &str,
    mut done: impl FnMut(&ProgressSnapshot) -> bool,
) {
    let mut rx = orchestrator.subscribe();
    let wait = async {
        loop {
            if done(&rx.borrow_and_update()) {
                return;
            }
            rx.changed().await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

fn in_progress(snapshot: &ProgressSnapshot, url: &str) -> bool {
    matches!(snapshot.get(url), Some(DownloadProgress::InProgress { .. }))
}

fn count_in_progress(snapshot: &ProgressSnapshot) -> usize {
    snapshot
        .values()
        .filter(|p| matches!(p, DownloadProgress::InProgress { .. }))
        .count()
}

/// 接受连接但从不响应的服务器，返回基础地址
async fn stalled_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{}", addr)
}

/// 每个连接只处理一个请求的极简 HTTP 服务器，响应由请求方法和路径决定
async fn raw_server(respond: fn(&str, &str) -> Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let mut parts = request.split_whitespace();
                let method = parts.next().unwrap_or_default();
                let path = parts.next().unwrap_or_default();
                let _ = socket.write_all(&respond(method, path)).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{}", addr)
}

fn http_response(status: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status, content_length
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_completes_and_lands_in_cache() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/media/clip.mp4")
        .with_status(200)
        .with_body(MP4_BYTES)
        .expect(1)
        .create_async()
        .await;
    let h = harness(3, PLENTY);
    let url = format!("{}/media/clip.mp4", server.url());

    assert!(h.orchestrator.queue(DownloadRequest::new(&url)).await);
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Completed { local_path } => {
            assert_eq!(local_path, h.cache.cache_file_for(&url));
            assert_eq!(std::fs::read(&local_path).unwrap(), MP4_BYTES);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    assert!(h.cache.is_cached(&url));
    mock.assert_async().await;

    let stats = h.orchestrator.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cached_file_short_circuits_without_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/a.mp4")
        .with_status(200)
        .with_body(MP4_BYTES)
        .expect(0)
        .create_async()
        .await;
    let h = harness(3, PLENTY);
    let url = format!("{}/a.mp4", server.url());
    std::fs::write(h.cache.cache_file_for(&url), MP4_BYTES).unwrap();

    assert!(h.orchestrator.queue(DownloadRequest::new(&url)).await);
    assert!(matches!(
        h.orchestrator.progress(&url),
        Some(DownloadProgress::Completed { .. })
    ));
    mock.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_five_redirects_are_followed() {
    let mut server = mockito::Server::new_async().await;
    for hop in 0..5 {
        server
            .mock("GET", format!("/hop/{}", hop).as_str())
            .with_status(302)
            .with_header("location", &format!("/hop/{}", hop + 1))
            .create_async()
            .await;
    }
    server
        .mock("GET", "/hop/5")
        .with_status(200)
        .with_body(MP4_BYTES)
        .create_async()
        .await;
    let h = harness(1, PLENTY);
    let url = format!("{}/hop/0", server.url());

    assert!(h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await);
    assert!(matches!(
        wait_terminal(&h.orchestrator, &url).await,
        DownloadProgress::Completed { .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_six_redirects_fail() {
    let mut server = mockito::Server::new_async().await;
    let base = server.url();
    for hop in 0..6 {
        server
            .mock("GET", format!("/long/{}", hop).as_str())
            .with_status(301)
            .with_header("location", &format!("{}/long/{}", base, hop + 1))
            .create_async()
            .await;
    }
    let final_hop = server
        .mock("GET", "/long/6")
        .with_status(200)
        .with_body(MP4_BYTES)
        .expect(0)
        .create_async()
        .await;
    let h = harness(1, PLENTY);
    let url = format!("{}/long/0", server.url());

    assert!(h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await);
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => assert!(reason.contains("Too many redirects")),
        other => panic!("expected Failed, got {:?}", other),
    }
    final_hop.assert_async().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redirect_without_location_fails() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/moved")
        .with_status(302)
        .create_async()
        .await;
    let h = harness(1, PLENTY);
    let url = format!("{}/moved", server.url());

    h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await;
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => assert!(reason.contains("Location")),
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_content_is_retried_then_rejected() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/fake.mp4")
        .with_status(200)
        .with_body("<html><body>login required</body></html>")
        .expect(2)
        .create_async()
        .await;
    let h = harness(2, PLENTY);
    let url = format!("{}/fake.mp4", server.url());

    h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await;
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => assert!(reason.contains("failed validation")),
        other => panic!("expected Failed, got {:?}", other),
    }
    mock.assert_async().await;
    assert!(!h.cache.cache_file_for(&url).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_md5_mismatch_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/b.mp4")
        .with_status(200)
        .with_body(MP4_BYTES)
        .create_async()
        .await;
    let h = harness(1, PLENTY);
    let url = format!("{}/b.mp4", server.url());

    let request = DownloadRequest::new(&url)
        .with_expected_size(64)
        .with_expected_hash("00000000000000000000000000000000");
    h.orchestrator.queue(request).await;
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => assert!(reason.contains("MD5")),
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_error_reports_status_and_truncated_body() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/missing.png")
        .with_status(404)
        .with_body("x".repeat(1000))
        .create_async()
        .await;
    let h = harness(1, PLENTY);
    let url = format!("{}/missing.png", server.url());

    h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await;
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => {
            assert!(reason.contains("404"));
            assert!(reason.len() < 300);
        }
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insufficient_storage_is_reported() {
    let server = mockito::Server::new_async().await;
    let h = harness(3, 0);
    let url = format!("{}/big.mp4", server.url());

    let accepted = h
        .orchestrator
        .queue(DownloadRequest::new(&url).with_expected_size(1024))
        .await;
    assert!(!accepted);
    assert_eq!(
        h.orchestrator.progress(&url),
        Some(DownloadProgress::Failed {
            reason: "Insufficient storage space".to_string()
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_stops_a_stalled_download() {
    let base = stalled_server().await;
    let h = harness(3, PLENTY);
    let url = format!("{}/stalled.mp4", base);
    assert!(h.orchestrator.queue(DownloadRequest::new(&url).with_expected_size(64)).await);

    // 等到任务真正开始
    wait_until(&h.orchestrator, "download start", |s| in_progress(s, &url)).await;

    assert!(h.orchestrator.cancel(&url));
    assert_eq!(wait_terminal(&h.orchestrator, &url).await, DownloadProgress::Cancelled);
    assert!(!h.orchestrator.cancel(&url));
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_then_immediate_requeue_completes() {
    // 第一个连接永远不响应，第二个连接返回有效的 MP4
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stalled, _) = listener.accept().await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(&http_response("200 OK", MP4_BYTES.len(), MP4_BYTES))
            .await;
        let _ = socket.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stalled);
    });

    let h = harness(1, PLENTY);
    let url = format!("http://{}/clip.mp4", addr);
    let request = DownloadRequest::new(&url).with_expected_size(64);
    assert!(h.orchestrator.queue(request.clone()).await);
    wait_until(&h.orchestrator, "first attempt", |s| in_progress(s, &url)).await;

    assert!(h.orchestrator.cancel(&url));
    assert!(h.orchestrator.queue(request).await);
    assert_eq!(h.orchestrator.progress(&url), Some(DownloadProgress::Queued));

    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Completed { local_path } => {
            assert_eq!(std::fs::read(local_path).unwrap(), MP4_BYTES);
        }
        other => panic!("expected Completed, got {:?}", other),
    }
    // 被取消的旧任务退出后也不能改写新请求的结果
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        h.orchestrator.progress(&url),
        Some(DownloadProgress::Completed { .. })
    ));
    assert_eq!(h.orchestrator.stats().completed, 1);
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_active_downloads_never_exceed_the_limit() {
    let base = stalled_server().await;
    let h = harness_with(PLENTY, |c| c.max_concurrent = 3);
    let urls: Vec<String> = (0..5).map(|i| format!("{}/{}.mp4", base, i)).collect();
    for url in &urls {
        assert!(h.orchestrator.queue(DownloadRequest::new(url).with_expected_size(64)).await);
    }

    wait_until(&h.orchestrator, "three active", |s| count_in_progress(s) == 3).await;
    // 多给调度循环几个周期，确认不会再启动更多任务
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = h.orchestrator.stats();
    assert_eq!(stats.active, 3);
    assert_eq!(stats.queued, 2);
    let snapshot = h.orchestrator.progress_snapshot();
    assert_eq!(count_in_progress(&snapshot), 3);
    assert_eq!(
        snapshot
            .values()
            .filter(|p| **p == DownloadProgress::Queued)
            .count(),
        2
    );
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_high_priority_jumps_ahead_of_normal() {
    let base = stalled_server().await;
    let h = harness_with(PLENTY, |c| c.max_concurrent = 1);
    let blocker = format!("{}/blocker.mp4", base);
    let normal_1 = format!("{}/n1.mp4", base);
    let normal_2 = format!("{}/n2.mp4", base);
    let urgent = format!("{}/urgent.mp4", base);

    h.orchestrator
        .queue(DownloadRequest::new(&blocker).with_expected_size(64))
        .await;
    wait_until(&h.orchestrator, "blocker start", |s| in_progress(s, &blocker)).await;

    for url in [&normal_1, &normal_2] {
        h.orchestrator
            .queue(DownloadRequest::new(url).with_expected_size(64))
            .await;
    }
    h.orchestrator
        .queue(
            DownloadRequest::new(&urgent)
                .with_expected_size(64)
                .with_priority(Priority::High),
        )
        .await;
    assert!(h.orchestrator.cancel(&blocker));

    wait_until(&h.orchestrator, "next task start", |s| count_in_progress(s) == 1).await;
    let snapshot = h.orchestrator.progress_snapshot();
    assert!(in_progress(&snapshot, &urgent));
    assert_eq!(snapshot.get(&normal_1), Some(&DownloadProgress::Queued));
    assert_eq!(snapshot.get(&normal_2), Some(&DownloadProgress::Queued));
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_all_cancels_queued_and_active() {
    let base = stalled_server().await;
    let h = harness_with(PLENTY, |c| c.max_concurrent = 2);
    let urls: Vec<String> = (0..4).map(|i| format!("{}/all{}.mp4", base, i)).collect();
    for url in &urls {
        h.orchestrator
            .queue(DownloadRequest::new(url).with_expected_size(64))
            .await;
    }
    wait_until(&h.orchestrator, "two active", |s| count_in_progress(s) == 2).await;

    h.orchestrator.cancel_all();

    for url in &urls {
        assert_eq!(h.orchestrator.progress(url), Some(DownloadProgress::Cancelled));
    }
    let stats = h.orchestrator.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queued, 0);

    // 被取消的任务退出时不会再写入其他状态
    tokio::time::sleep(Duration::from_millis(300)).await;
    for url in &urls {
        assert_eq!(h.orchestrator.progress(url), Some(DownloadProgress::Cancelled));
    }
    h.orchestrator.shutdown();
}

fn sized_media(method: &str, path: &str) -> Vec<u8> {
    match (method, path) {
        ("HEAD", "/large.mp4") => http_response("200 OK", 5000, b""),
        ("HEAD", "/small.mp4") => http_response("200 OK", 64, b""),
        ("GET", "/small.mp4") => http_response("200 OK", MP4_BYTES.len(), MP4_BYTES),
        _ => http_response("405 Method Not Allowed", 0, b""),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_head_request_sizes_the_space_check() {
    let base = raw_server(sized_media).await;
    let h = harness_with(PLENTY, |c| {
        c.max_attempts = 1;
        c.cache_limits = small_cache(1000);
    });

    let large = format!("{}/large.mp4", base);
    assert!(!h.orchestrator.queue(DownloadRequest::new(&large)).await);
    assert_eq!(
        h.orchestrator.progress(&large),
        Some(DownloadProgress::Failed {
            reason: "Insufficient storage space".to_string()
        })
    );

    let small = format!("{}/small.mp4", base);
    assert!(h.orchestrator.queue(DownloadRequest::new(&small)).await);
    assert!(matches!(
        wait_terminal(&h.orchestrator, &small).await,
        DownloadProgress::Completed { .. }
    ));
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_head_request_falls_back_to_default_size() {
    let base = raw_server(sized_media).await;
    let url = format!("{}/no-head.mp4", base);

    // HEAD 失败时按默认估计值申请空间：超过上限则拒绝
    let h = harness_with(PLENTY, |c| {
        c.max_attempts = 1;
        c.cache_limits = small_cache(1000);
        c.default_expected_size = 2000;
    });
    assert!(!h.orchestrator.queue(DownloadRequest::new(&url)).await);

    // 估计值放得下时照常排队，随后因 GET 失败而失败
    let h = harness_with(PLENTY, |c| {
        c.max_attempts = 1;
        c.cache_limits = small_cache(1000);
        c.default_expected_size = 500;
    });
    assert!(h.orchestrator.queue(DownloadRequest::new(&url)).await);
    match wait_terminal(&h.orchestrator, &url).await {
        DownloadProgress::Failed { reason } => assert!(reason.contains("405")),
        other => panic!("expected Failed, got {:?}", other),
    }
    h.orchestrator.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_delay_grows_linearly() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky.mp4")
        .with_status(500)
        .expect(4)
        .create_async()
        .await;
    let h = harness_with(PLENTY, |c| {
        c.max_attempts = 4;
        c.retry_step = Duration::from_millis(150);
    });
    let url = format!("{}/flaky.mp4", server.url());

    let started = Instant::now();
    h.orchestrator
        .queue(DownloadRequest::new(&url).with_expected_size(64))
        .await;

    let mut rx = h.orchestrator.subscribe();
    let mut retries: Vec<String> = Vec::new();
    let collect = async {
        loop {
            match rx.borrow_and_update().get(&url) {
                Some(DownloadProgress::InProgress { status, .. })
                    if status.contains("重试") && retries.last() != Some(status) =>
                {
                    retries.push(status.clone());
                }
                Some(p) if p.is_terminal() => return,
                _ => {}
            }
            rx.changed().await.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .expect("download did not settle in time");

    // 第 n 次失败后等待 n * 150ms
    assert_eq!(
        retries,
        vec![
            "150ms 后进行第 2 次重试",
            "300ms 后进行第 3 次重试",
            "450ms 后进行第 4 次重试",
        ]
    );
    assert!(started.elapsed() >= Duration::from_millis(900));
    mock.assert_async().await;
}

