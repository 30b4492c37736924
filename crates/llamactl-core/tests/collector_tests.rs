use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use llamactl_backend::LogStream;
use llamactl_core::logs::LogCollector;
use llamactl_core::TelemetryStore;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

fn stream(items: Vec<std::io::Result<String>>, follow: bool) -> LogStream {
    let lines = tokio_stream::iter(items);
    if follow {
        Box::pin(tokio_stream::StreamExt::chain(lines, tokio_stream::pending()))
    } else {
        Box::pin(lines)
    }
}

async fn until_finished(collector: &LogCollector) {
    for _ in 0..200 {
        if collector.is_finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("collector did not finish");
}

#[tokio::test]
async fn stream_error_leaves_one_diagnostic_and_exits() {
    let store = Arc::new(TelemetryStore::new(10));
    let items = vec![
        Ok("first".to_string()),
        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed")),
        Ok("never read".to_string()),
    ];
    let collector = LogCollector::spawn(stream(items, false), store.clone(), CancellationToken::new());
    until_finished(&collector).await;
    let lines = store.log_tail(10);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "first");
    assert!(lines[1].starts_with("(log collection error"));
}

#[tokio::test]
async fn stop_returns_promptly_on_an_idle_stream() {
    let store = Arc::new(TelemetryStore::new(10));
    let collector = LogCollector::spawn(stream(vec![Ok("x".into())], true), store, CancellationToken::new());
    let graceful = tokio::time::timeout(Duration::from_secs(1), collector.stop()).await.expect("stop hung");
    assert!(graceful);
}

/// Blocks its worker thread on the first poll, like a read stuck in a
/// syscall, and flags when it is dropped.
struct StuckStream {
    entered: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
    block: Duration,
}

impl Stream for StuckStream {
    type Item = std::io::Result<String>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.entered.swap(true, Ordering::SeqCst) {
            std::thread::sleep(self.block);
        }
        Poll::Pending
    }
}

impl Drop for StuckStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresponsive_collector_is_aborted_after_the_grace_period() {
    let store = Arc::new(TelemetryStore::new(10));
    let entered = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));
    let lines = StuckStream { entered: entered.clone(), dropped: dropped.clone(), block: Duration::from_millis(800) };
    let collector = LogCollector::spawn(Box::pin(lines), store, CancellationToken::new())
        .with_stop_grace(Duration::from_millis(100));
    while !entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let started = Instant::now();
    let graceful = collector.stop().await;
    assert!(!graceful);
    assert!(started.elapsed() < Duration::from_millis(500), "stop took {:?}", started.elapsed());

    // the task is torn down once the blocked poll returns
    for _ in 0..300 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("collector task was never torn down");
}

#[tokio::test]
async fn shutdown_token_ends_the_collector() {
    let store = Arc::new(TelemetryStore::new(10));
    let token = CancellationToken::new();
    let collector = LogCollector::spawn(stream(Vec::new(), true), store, token.clone());
    token.cancel();
    until_finished(&collector).await;
}

#[tokio::test]
async fn buffer_stays_bounded_under_a_long_stream() {
    let store = Arc::new(TelemetryStore::new(50));
    let items = (0..500).map(|i| Ok(format!("line {i}"))).collect();
    let collector = LogCollector::spawn(stream(items, false), store.clone(), CancellationToken::new());
    until_finished(&collector).await;
    let lines = store.log_tail(1000);
    assert_eq!(lines.len(), 50);
    assert_eq!(lines.first().map(String::as_str), Some("line 450"));
    assert_eq!(lines.last().map(String::as_str), Some("line 499"));
}
