use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use cc_ingest::backoff::{retry, RetryPolicy};
use cc_ingest::commoncrawl::{FetchError, HttpRangeFetcher, RangeFetch};

const OBJECT: &[u8] = b"0123456789abcdefghij";

async fn serve_range(Path(name): Path<String>, headers: HeaderMap) -> (StatusCode, Vec<u8>) {
    if name == "full.warc.gz" {
        return (StatusCode::OK, OBJECT.to_vec());
    }
    if name != "seg.warc.gz" {
        return (StatusCode::NOT_FOUND, Vec::new());
    }
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
    match range {
        Some((start, end)) if end < OBJECT.len() => {
            (StatusCode::PARTIAL_CONTENT, OBJECT[start..=end].to_vec())
        }
        _ => (StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()),
    }
}

async fn start_server() -> String {
    let app = Router::new().route("/crawl-data/:name", get(serve_range));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn fetches_exactly_the_requested_range() {
    let base_url = start_server().await;
    let fetcher = HttpRangeFetcher::new(&base_url, Duration::from_secs(5)).unwrap();

    let bytes = fetcher.fetch_range("crawl-data/seg.warc.gz", 3, 4).await.unwrap();
    assert_eq!(&bytes[..], b"3456");
    let empty = fetcher.fetch_range("crawl-data/seg.warc.gz", 3, 0).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn non_partial_responses_are_permanent_errors() {
    let base_url = start_server().await;
    let fetcher = HttpRangeFetcher::new(&base_url, Duration::from_secs(5)).unwrap();

    let err = fetcher
        .fetch_range("crawl-data/missing.warc.gz", 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 404, .. }));
    assert!(!err.is_transient());

    // a server ignoring the Range header would hand back the whole object
    let err = fetcher
        .fetch_range("crawl-data/full.warc.gz", 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Status { status: 200, .. }));
}

/// Stalls the first `stalls` requests past the client timeout, then serves ranges.
async fn start_stalling_server(stalls: u32) -> (String, Arc<AtomicU32>) {
    let requests = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/crawl-data/:name",
            get(
                move |State(requests): State<Arc<AtomicU32>>, name: Path<String>, headers: HeaderMap| async move {
                    if requests.fetch_add(1, Ordering::SeqCst) < stalls {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    serve_range(name, headers).await
                },
            ),
        )
        .with_state(requests.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), requests)
}

#[tokio::test]
async fn timed_out_fetches_are_retried_until_they_succeed() {
    let (base_url, requests) = start_stalling_server(3).await;
    let fetcher = HttpRangeFetcher::new(&base_url, Duration::from_millis(200))
        .unwrap()
        .with_policy(RetryPolicy::new(Duration::from_millis(10)));

    let bytes = fetcher.fetch_range("crawl-data/seg.warc.gz", 10, 5).await.unwrap();
    assert_eq!(&bytes[..], b"abcde");
    assert_eq!(requests.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn bounded_fetch_policy_surfaces_the_timeout() {
    let (base_url, requests) = start_stalling_server(u32::MAX).await;
    let fetcher = HttpRangeFetcher::new(&base_url, Duration::from_millis(100))
        .unwrap()
        .with_policy(RetryPolicy::new(Duration::from_millis(10)).with_max_attempts(2));

    let err = fetcher
        .fetch_range("crawl-data/seg.warc.gz", 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Timeout { .. }));
    assert!(err.is_transient());
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially() {
    let counter = AtomicU32::new(0);
    let failures = &counter;
    let start = tokio::time::Instant::now();

    let result = retry(&RetryPolicy::fetch(), "segment", FetchError::is_transient, move || async move {
        if failures.fetch_add(1, Ordering::SeqCst) < 3 {
            Err(FetchError::Timeout {
                url: "segment".into(),
            })
        } else {
            Ok(42)
        }
    })
    .await;

    assert_eq!(result, Ok(42));
    assert_eq!(failures.load(Ordering::SeqCst), 4);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn permanent_failures_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let result: Result<(), FetchError> =
        retry(&RetryPolicy::fetch(), "segment", FetchError::is_transient, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Status {
                url: "segment".into(),
                status: 403,
            })
        })
        .await;

    assert!(matches!(result, Err(FetchError::Status { status: 403, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
