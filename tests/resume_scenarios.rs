//! End-to-end download scenarios against a mock HTTP server.
//!
//! The mock serves a byte-range-aware file so resume, restart, and
//! already-complete paths can be exercised exactly as a real server would
//! drive them.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use downdraft_core::{
    Coordinator, DownloadError, DownloadStatus, EngineConfig, Outcome, ProgressEvent,
    RecordPatch, StateStore, partial_path,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Range-aware mock file. Honors `Range: bytes=N-` with 206/416 like a real
/// static file server, and records every request's method and range start.
struct RangeFile {
    body: Vec<u8>,
    /// When false, range headers are ignored entirely and `Accept-Ranges`
    /// is never advertised.
    honor_range: bool,
    /// When true, HEAD probes honor ranges but GET replies 200 with the
    /// full body (a lying server).
    full_body_on_get: bool,
    seen: Arc<Mutex<Vec<(String, Option<u64>)>>>,
}

impl RangeFile {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            honor_range: true,
            full_body_on_get: false,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn without_range_support(mut self) -> Self {
        self.honor_range = false;
        self
    }

    fn lying_on_get(mut self) -> Self {
        self.full_body_on_get = true;
        self
    }

    fn seen(&self) -> Arc<Mutex<Vec<(String, Option<u64>)>>> {
        Arc::clone(&self.seen)
    }
}

fn parse_range_start(request: &Request) -> Option<u64> {
    let value = request.headers.get("range")?.to_str().ok()?;
    value
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let method = request.method.to_string();
        let range_start = parse_range_start(request);
        self.seen.lock().unwrap().push((method.clone(), range_start));

        let len = self.body.len() as u64;
        let full = || {
            let mut template = ResponseTemplate::new(200)
                .insert_header("content-length", len.to_string().as_str())
                .set_body_bytes(self.body.clone());
            if self.honor_range {
                template = template.insert_header("accept-ranges", "bytes");
            }
            template
        };

        if !self.honor_range {
            return full();
        }
        if self.full_body_on_get && method == "GET" {
            return full();
        }

        match range_start {
            None => full(),
            Some(start) if start >= len => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{len}").as_str()),
            Some(start) => {
                let slice = self.body[start as usize..].to_vec();
                ResponseTemplate::new(206)
                    .insert_header(
                        "content-range",
                        format!("bytes {start}-{}/{len}", len - 1).as_str(),
                    )
                    .insert_header("content-length", slice.len().to_string().as_str())
                    .set_body_bytes(slice)
            }
        }
    }
}

/// A resource that shrank after a prior run recorded it: HEAD probes with a
/// range still see the old length, but a ranged GET collides with the new,
/// shorter resource and gets 416. Requests without a range see the current
/// resource.
struct ShrunkFile {
    old_len: u64,
    body: Vec<u8>,
    seen: Arc<Mutex<Vec<(String, Option<u64>)>>>,
}

impl ShrunkFile {
    fn new(old_len: u64, body: Vec<u8>) -> Self {
        Self {
            old_len,
            body,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn seen(&self) -> Arc<Mutex<Vec<(String, Option<u64>)>>> {
        Arc::clone(&self.seen)
    }
}

impl Respond for ShrunkFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let method = request.method.to_string();
        let range_start = parse_range_start(request);
        self.seen.lock().unwrap().push((method.clone(), range_start));

        let len = self.body.len() as u64;
        match range_start {
            Some(start) if method == "HEAD" => {
                // Stale view: the probe still believes the old length.
                let old = self.old_len;
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes {start}-{}/{old}", old - 1).as_str())
                    .insert_header("content-length", (old - start).to_string().as_str())
            }
            Some(_) => ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{len}").as_str()),
            None => ResponseTemplate::new(200)
                .insert_header("content-length", len.to_string().as_str())
                .insert_header("accept-ranges", "bytes")
                .set_body_bytes(self.body.clone()),
        }
    }
}

/// Raw HTTP server that closes the connection partway through the first
/// full-body GET, then behaves like a normal range-aware file server.
/// Records each GET's range start.
async fn drop_midway_server(
    body: Vec<u8>,
    cut_after: usize,
) -> (String, Arc<Mutex<Vec<Option<u64>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/file.bin", listener.local_addr().unwrap());
    let gets: Arc<Mutex<Vec<Option<u64>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&gets);

    tokio::spawn(async move {
        let mut dropped_once = false;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            if head.is_empty() {
                continue;
            }
            let head = String::from_utf8_lossy(&head).to_lowercase();
            let is_head = head.starts_with("head ");
            let start = head
                .lines()
                .find_map(|line| line.trim_end().strip_prefix("range: bytes="))
                .and_then(|range| range.strip_suffix('-'))
                .and_then(|range| range.parse::<u64>().ok());
            if !is_head {
                gets.lock().unwrap().push(start);
            }

            let len = body.len();
            let header = match start {
                Some(s) => format!(
                    "HTTP/1.1 206 Partial Content\r\ncontent-range: bytes {s}-{}/{len}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    len - 1,
                    len as u64 - s
                ),
                None => format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {len}\r\naccept-ranges: bytes\r\nconnection: close\r\n\r\n"
                ),
            };
            let _ = socket.write_all(header.as_bytes()).await;
            if is_head {
                continue;
            }
            if start.is_none() && !dropped_once {
                dropped_once = true;
                // Send a truncated body, then close short of the declared
                // content length.
                let _ = socket.write_all(&body[..cut_after]).await;
                let _ = socket.flush().await;
                continue;
            }
            let from = start.unwrap_or(0) as usize;
            let _ = socket.write_all(&body[from..]).await;
            let _ = socket.flush().await;
        }
    });

    (url, seen)
}

fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_config() -> EngineConfig {
    EngineConfig {
        chunk_size: 1024,
        max_retries: 3,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        checkpoint_interval: Duration::ZERO,
        ..EngineConfig::default()
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<StateStore>,
    coordinator: Coordinator,
    destination: std::path::PathBuf,
}

fn harness(config: EngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("downloads.json")).unwrap());
    let coordinator = Coordinator::new(Arc::clone(&store), config).unwrap();
    let destination = dir.path().join("file.bin");
    Harness {
        _dir: dir,
        store,
        coordinator,
        destination,
    }
}

/// Seeds the ledger and the `.part` file as if a prior run was interrupted
/// after `bytes` flushed bytes.
fn seed_partial(h: &Harness, url: &str, body: &[u8], bytes: usize, total: u64) -> String {
    let id = StateStore::download_id(url, &h.destination);
    h.store.begin(&id, url, &h.destination, total).unwrap();
    h.store
        .upsert(&id, &RecordPatch::checkpoint(bytes as u64, 1))
        .unwrap();
    std::fs::write(partial_path(&h.destination), &body[..bytes]).unwrap();
    id
}

fn assert_completed(outcome: &Outcome, destination: &Path, body: &[u8]) {
    match outcome {
        Outcome::Completed {
            final_path,
            bytes_downloaded,
        } => {
            assert_eq!(final_path, destination);
            assert_eq!(*bytes_downloaded, body.len() as u64);
        }
        other => panic!("Expected Completed, got: {other:?}"),
    }
    assert_eq!(std::fs::read(destination).unwrap(), body);
    assert!(
        !partial_path(destination).exists(),
        "part file must be promoted away"
    );
}

#[tokio::test]
async fn test_fresh_download_completes_and_records_state() {
    let server = MockServer::start().await;
    let body = test_body(10 * 1024);
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
    let record = h
        .store
        .get(&StateStore::download_id(&url, &h.destination))
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.downloaded_size, body.len() as u64);
    assert_eq!(record.total_size, body.len() as u64);
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn test_resume_fetches_only_the_missing_tail() {
    let server = MockServer::start().await;
    let body = test_body(10 * 1024);
    let responder = RangeFile::new(body.clone());
    let seen = responder.seen();
    Mock::given(path("/file.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    seed_partial(&h, &url, &body, 3 * 1024, body.len() as u64);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
    // The GET must have started exactly at the partial length.
    let seen = seen.lock().unwrap();
    let get_ranges: Vec<_> = seen
        .iter()
        .filter(|(method, _)| method == "GET")
        .collect();
    assert_eq!(get_ranges.len(), 1);
    assert_eq!(get_ranges[0].1, Some(3 * 1024));
}

#[tokio::test]
async fn test_resume_progress_is_monotonic_and_includes_prefix() {
    let server = MockServer::start().await;
    let body = test_body(8 * 1024);
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    seed_partial(&h, &url, &body, 2 * 1024, body.len() as u64);

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink = move |event: ProgressEvent| sink_events.lock().unwrap().push(event);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), Some(&sink))
        .await;
    assert_completed(&outcome, &h.destination, &body);

    let events = events.lock().unwrap();
    assert!(!events.is_empty());
    // First event already includes the resumed prefix.
    assert!(events[0].downloaded_bytes > 2 * 1024);
    assert!(
        events
            .windows(2)
            .all(|w| w[0].downloaded_bytes <= w[1].downloaded_bytes),
        "progress must never go backwards"
    );
    assert_eq!(events.last().unwrap().downloaded_bytes, body.len() as u64);
    assert_eq!(events.last().unwrap().status_label, "completed");
}

#[tokio::test]
async fn test_completed_record_short_circuits_without_network() {
    let server = MockServer::start().await;
    // No mocks mounted: any request would 404 and fail the run.

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let body = test_body(4096);
    std::fs::write(&h.destination, &body).unwrap();

    let id = StateStore::download_id(&url, &h.destination);
    h.store
        .begin(&id, &url, &h.destination, body.len() as u64)
        .unwrap();
    h.store
        .upsert(&id, &RecordPatch::checkpoint(body.len() as u64, 4))
        .unwrap();
    h.store
        .upsert(&id, &RecordPatch::status(DownloadStatus::Completed))
        .unwrap();

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert!(matches!(outcome, Outcome::Completed { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_range_support_restarts_from_zero() {
    let server = MockServer::start().await;
    let body = test_body(6 * 1024);
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()).without_range_support())
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    // The stale prefix deliberately disagrees with the real body.
    let mut stale = test_body(6 * 1024);
    stale.iter_mut().for_each(|b| *b = b.wrapping_add(1));
    seed_partial(&h, &url, &stale, 2 * 1024, body.len() as u64);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    // The final file is byte-identical to the server's content: the
    // untrustworthy prefix was discarded, not spliced.
    assert_completed(&outcome, &h.destination, &body);
}

#[tokio::test]
async fn test_oversized_stale_partial_is_refetched_not_promoted() {
    let server = MockServer::start().await;
    let body = test_body(4 * 1024);
    let responder = RangeFile::new(body.clone());
    let seen = responder.seen();
    Mock::given(path("/file.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    // A prior run captured 6 KiB of a resource that has since shrunk to
    // 4 KiB, so the probe's range request lands past the new end (416).
    let mut stale = test_body(6 * 1024);
    stale.iter_mut().for_each(|b| *b = b.wrapping_add(1));
    seed_partial(&h, &url, &stale, 6 * 1024, 6 * 1024);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    // The oversized prefix must be discarded and refetched, never renamed
    // into place as a "complete" file.
    assert_completed(&outcome, &h.destination, &body);
    let record = h
        .store
        .get(&StateStore::download_id(&url, &h.destination))
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.total_size, body.len() as u64);
    assert_eq!(record.downloaded_size, body.len() as u64);
    // The refetch started from zero.
    let seen = seen.lock().unwrap();
    let gets: Vec<_> = seen.iter().filter(|(m, _)| m == "GET").collect();
    assert_eq!(gets.len(), 1);
    assert_eq!(gets[0].1, None);
}

#[tokio::test]
async fn test_resource_shrunk_between_probe_and_get_restarts_free() {
    let server = MockServer::start().await;
    let old_body = test_body(8 * 1024);
    let body = test_body(4 * 1024);
    let responder = ShrunkFile::new(old_body.len() as u64, body.clone());
    let seen = responder.seen();
    Mock::given(path("/file.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;

    // Zero retry budget: the restart must not cost an attempt.
    let h = harness(EngineConfig {
        max_retries: 0,
        ..test_config()
    });
    let url = format!("{}/file.bin", server.uri());
    seed_partial(&h, &url, &old_body, 2 * 1024, old_body.len() as u64);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
    // First GET tried to resume, hit 416, and the rerun started fresh.
    let seen = seen.lock().unwrap();
    let gets: Vec<_> = seen.iter().filter(|(m, _)| m == "GET").collect();
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].1, Some(2 * 1024));
    assert_eq!(gets[1].1, None);
}

#[tokio::test]
async fn test_range_ignored_on_get_restarts_without_spending_retries() {
    let server = MockServer::start().await;
    let body = test_body(5 * 1024);
    let responder = RangeFile::new(body.clone()).lying_on_get();
    let seen = responder.seen();
    Mock::given(path("/file.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let h = harness(EngineConfig {
        max_retries: 1,
        ..test_config()
    });
    let url = format!("{}/file.bin", server.uri());
    seed_partial(&h, &url, &body, 2 * 1024, body.len() as u64);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    // Even with a budget of one attempt, the 200-instead-of-206 fallback
    // still restarts and completes.
    assert_completed(&outcome, &h.destination, &body);
    // Second GET carried no range header (fresh start).
    let seen = seen.lock().unwrap();
    let gets: Vec<_> = seen.iter().filter(|(m, _)| m == "GET").collect();
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[0].1, Some(2 * 1024));
    assert_eq!(gets[1].1, None);
}

#[tokio::test]
async fn test_already_complete_416_finishes_without_refetch() {
    let server = MockServer::start().await;
    let body = test_body(4096);
    let responder = RangeFile::new(body.clone());
    let seen = responder.seen();
    Mock::given(path("/file.bin"))
        .respond_with(responder)
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    // Every byte already on disk, but the run never got to finalize.
    seed_partial(&h, &url, &body, body.len(), body.len() as u64);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
    // Only the probe reached the server.
    assert!(seen.lock().unwrap().iter().all(|(m, _)| m == "HEAD"));
}

#[tokio::test]
async fn test_fatal_404_fails_immediately_without_retries() {
    let server = MockServer::start().await;
    Mock::given(path("/file.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    match outcome {
        Outcome::Failed { error, attempts } => {
            assert_eq!(error.http_status(), Some(404));
            assert_eq!(attempts, 1);
        }
        other => panic!("Expected Failed, got: {other:?}"),
    }
    // A single probe request, no retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    let record = h
        .store
        .get(&StateStore::download_id(&url, &h.destination))
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(record.error.unwrap().contains("404"));
}

#[tokio::test]
async fn test_transient_503_retries_then_succeeds() {
    let server = MockServer::start().await;
    let body = test_body(2048);
    Mock::given(path("/file.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .with_priority(5)
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
}

#[tokio::test]
async fn test_connection_drop_mid_stream_resumes_surviving_prefix() {
    let body = test_body(8 * 1024);
    // The first GET dies 2.5 KiB in; only the two full flushed chunks
    // survive on disk.
    let (url, gets) = drop_midway_server(body.clone(), 2 * 1024 + 512).await;

    let h = harness(test_config());
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
    // The retry's GET picked up exactly at the flushed byte count instead
    // of starting over.
    let gets = gets.lock().unwrap();
    assert_eq!(*gets, vec![None, Some(2 * 1024)]);
}

#[tokio::test]
async fn test_transient_errors_exhaust_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(path("/file.bin"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    match outcome {
        Outcome::Failed { error, attempts } => {
            assert_eq!(error.http_status(), Some(503));
            // Initial attempt plus max_retries.
            assert_eq!(attempts, 4);
        }
        other => panic!("Expected Failed, got: {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_cancellation_pauses_with_resumable_state() {
    let server = MockServer::start().await;
    let body = test_body(8 * 1024);
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.coordinator.run(&url, &h.destination, &cancel, None).await;

    match outcome {
        Outcome::Cancelled { bytes_downloaded } => assert_eq!(bytes_downloaded, 0),
        other => panic!("Expected Cancelled, got: {other:?}"),
    }
    let record = h
        .store
        .get(&StateStore::download_id(&url, &h.destination))
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);

    // The same command resumes to completion once cancellation is lifted.
    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;
    assert_completed(&outcome, &h.destination, &body);
}

#[tokio::test]
async fn test_total_size_change_discards_stale_prefix() {
    let server = MockServer::start().await;
    let body = test_body(7 * 1024);
    Mock::given(path("/file.bin"))
        .respond_with(RangeFile::new(body.clone()))
        .mount(&server)
        .await;

    let h = harness(test_config());
    let url = format!("{}/file.bin", server.uri());
    // Checkpoint recorded against a differently-sized (older) resource.
    seed_partial(&h, &url, &body, 2 * 1024, 9 * 1024);

    let outcome = h
        .coordinator
        .run(&url, &h.destination, &CancellationToken::new(), None)
        .await;

    assert_completed(&outcome, &h.destination, &body);
}

#[tokio::test]
async fn test_invalid_url_fails_without_touching_network() {
    let h = harness(test_config());
    let outcome = h
        .coordinator
        .run("not a url", &h.destination, &CancellationToken::new(), None)
        .await;

    match outcome {
        Outcome::Failed { error, attempts } => {
            assert!(matches!(error, DownloadError::InvalidUrl { .. }));
            assert_eq!(attempts, 0);
        }
        other => panic!("Expected Failed, got: {other:?}"),
    }
}
