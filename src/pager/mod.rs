//! Offset pager: split a record range across workers, page each window sequentially,
//! merge results in completion order.

pub mod window;
pub mod worker;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::http::Transport;
use crate::progress::Progress;

pub use window::{PageWindow, WindowAccumulator};
pub use worker::{fetch_page, run_worker, FetchPageResult, PageOutcome, PagerSettings, StopReason, WorkerReport};

/// Per-worker summary kept after the records are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub window: PageWindow,
    pub records: usize,
    pub pages: usize,
    pub stop: StopReason,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PagerOutcome<T> {
    /// Order within a worker is preserved; order across workers is completion order.
    pub records: Vec<T>,
    pub workers: Vec<WorkerSummary>,
}

impl<T> PagerOutcome<T> {
    /// Workers that stopped on a failure or an exhausted retry budget.
    pub fn incomplete_workers(&self) -> impl Iterator<Item = &WorkerSummary> {
        self.workers.iter().filter(|w| !w.stop.is_clean())
    }
}

pub struct OffsetPager {
    transport: Arc<dyn Transport>,
    settings: PagerSettings,
    progress: Progress,
}

impl OffsetPager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            settings: PagerSettings::default(),
            progress: Progress::disabled(),
        }
    }

    pub fn with_settings(mut self, settings: PagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch exactly `[start, end)` split evenly across `workers` bounded workers.
    pub async fn fetch_range<T>(&self, url: &str, user: &str, start: u64, end: u64, workers: usize, label: &str) -> PagerOutcome<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.fetch(url, user, PageWindow::partition(start, end, workers), label)
            .await
    }

    /// Run one worker per window in parallel and merge what each returns.
    ///
    /// Workers share nothing but the transport; a worker that fails or panics only loses its own
    /// window.
    pub async fn fetch<T>(&self, url: &str, user: &str, windows: Vec<PageWindow>, label: &str) -> PagerOutcome<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let total = windows.len();
        self.progress.publish(format!("{label} (0/{total} workers)"));

        let mut set = JoinSet::new();
        for window in windows {
            set.spawn(run_worker::<T>(
                Arc::clone(&self.transport),
                url.to_string(),
                user.to_string(),
                window,
                self.settings.clone(),
            ));
        }

        let mut records = Vec::new();
        let mut workers = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    if !report.stop.is_clean() {
                        warn!(
                            worker = report.window.worker_id,
                            start = report.window.start,
                            stop = ?report.stop,
                            error = report.error.as_deref().unwrap_or(""),
                            "Pager worker stopped early, keeping {} records",
                            report.records.len()
                        );
                    }
                    workers.push(WorkerSummary {
                        window: report.window,
                        records: report.records.len(),
                        pages: report.pages,
                        stop: report.stop,
                        error: report.error,
                    });
                    records.extend(report.records);
                }
                Err(e) => warn!("Pager worker task died: {e}"),
            }
            self.progress
                .publish(format!("{label} ({}/{total} workers)", workers.len()));
        }

        info!(workers = total, records = records.len(), "{label} complete");
        PagerOutcome { records, workers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::backoff::{BackoffPolicy, Pacing};
    use crate::http::fake::{ok, status, FakeTransport, Request};
    use crate::http::TransportError;

    fn fast_settings(page_size: usize) -> PagerSettings {
        PagerSettings {
            page_size,
            policy: BackoffPolicy::fixed(Duration::from_millis(1), 5),
            pacing: Pacing::none(),
        }
    }

    /// Serves `total` records `{"i": n}`. `shape` decides how many records a page actually holds
    /// given the requested limit.
    fn dataset(total: usize, shape: fn(usize) -> usize) -> FakeTransport {
        FakeTransport::new(move |req: &Request| {
            let offset = req.param_usize("offset");
            let limit = req.param_usize("limit");
            let count = shape(limit);
            let end = (offset + count).min(total);
            let page: Vec<Value> = (offset.min(end)..end).map(|i| json!({ "i": i })).collect();
            ok(Value::Array(page))
        })
    }

    fn indexes(records: &[Value]) -> Vec<u64> {
        let mut ids: Vec<u64> = records.iter().filter_map(|r| r["i"].as_u64()).collect();
        ids.sort_unstable();
        ids
    }

    async fn run(transport: FakeTransport, windows: Vec<PageWindow>, page_size: usize) -> PagerOutcome<Value> {
        OffsetPager::new(Arc::new(transport))
            .with_settings(fast_settings(page_size))
            .fetch::<Value>("http://fake/closed-positions", "0xuser", windows, "test")
            .await
    }

    #[tokio::test]
    async fn bounded_windows_cover_range_exactly_with_over_fetch() {
        // server ignores the limit and always sends 7 more than asked
        let transport = dataset(5_000, |limit| limit + 7);
        let outcome = run(transport, PageWindow::partition(0, 1000, 4), 60).await;
        assert_eq!(indexes(&outcome.records), (0..1000).collect::<Vec<_>>());
        assert!(outcome.workers.iter().all(|w| w.stop == StopReason::WindowFilled));
    }

    #[tokio::test]
    async fn bounded_windows_cover_range_exactly_with_short_pages() {
        let transport = dataset(5_000, |limit| limit.min(13));
        let outcome = OffsetPager::new(Arc::new(transport))
            .with_settings(fast_settings(50))
            .fetch_range::<Value>("http://fake/closed-positions", "0xuser", 100, 400, 3, "test")
            .await;
        assert_eq!(indexes(&outcome.records), (100..400).collect::<Vec<_>>());
        assert_eq!(outcome.workers.len(), 3);
    }

    #[tokio::test]
    async fn range_past_end_of_data_returns_what_exists() {
        let transport = dataset(730, |limit| limit);
        let outcome = run(transport, PageWindow::partition(0, 1000, 4), 100).await;
        assert_eq!(indexes(&outcome.records), (0..730).collect::<Vec<_>>());
        let ended: Vec<_> = outcome
            .workers
            .iter()
            .filter(|w| w.stop == StopReason::EndOfData)
            .collect();
        // worker 3 runs dry inside its window, worker 4 finds nothing at all
        assert_eq!(ended.len(), 2);
    }

    #[tokio::test]
    async fn unbounded_worker_stops_on_short_page() {
        let transport = dataset(1_234, |limit| limit);
        let outcome = run(transport, PageWindow::staggered(250, 3), 100).await;
        assert_eq!(indexes(&outcome.records), (0..1234).collect::<Vec<_>>());
        let last = outcome.workers.iter().find(|w| w.window.worker_id == 3).unwrap();
        assert_eq!(last.stop, StopReason::EndOfData);
        assert_eq!(last.records, 734);
    }

    #[tokio::test]
    async fn rate_limit_is_retried_at_same_offset() {
        let hits = std::sync::atomic::AtomicUsize::new(0);
        let transport = FakeTransport::new(move |req: &Request| {
            let offset = req.param_usize("offset");
            // every offset is rate limited twice before it succeeds
            let n = hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n % 3 != 2 {
                return status(429);
            }
            let end = (offset + req.param_usize("limit")).min(20);
            ok(Value::Array((offset..end).map(|i| json!({ "i": i })).collect()))
        });
        let outcome = run(transport, vec![PageWindow::bounded(1, 0, 20)], 10).await;
        assert_eq!(indexes(&outcome.records), (0..20).collect::<Vec<_>>());
        assert_eq!(outcome.workers[0].pages, 2);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_keeps_partial_result() {
        let transport = FakeTransport::new(|req: &Request| {
            let offset = req.param_usize("offset");
            if offset >= 10 {
                return status(429);
            }
            ok(Value::Array((offset..offset + 10).map(|i| json!({ "i": i })).collect()))
        });
        let fake = Arc::new(transport);
        let outcome = OffsetPager::new(fake.clone())
            .with_settings(fast_settings(10))
            .fetch::<Value>("http://fake/x", "0xuser", vec![PageWindow::bounded(1, 0, 50)], "test")
            .await;
        assert_eq!(outcome.records.len(), 10);
        assert_eq!(outcome.workers[0].stop, StopReason::RetriesExhausted);
        // one success, then the first attempt plus 5 retries at offset 10
        assert_eq!(fake.call_count(), 1 + 6);
        assert_eq!(outcome.incomplete_workers().count(), 1);
    }

    #[tokio::test]
    async fn fatal_status_aborts_only_that_worker() {
        let transport = FakeTransport::new(|req: &Request| {
            let offset = req.param_usize("offset");
            if offset == 15 {
                return status(500);
            }
            let end = offset + req.param_usize("limit");
            ok(Value::Array((offset..end).map(|i| json!({ "i": i })).collect()))
        });
        let fake = Arc::new(transport);
        let outcome = OffsetPager::new(fake.clone())
            .with_settings(fast_settings(5))
            .fetch::<Value>("http://fake/x", "0xuser", PageWindow::partition(0, 40, 2), "test")
            .await;

        let w1 = outcome.workers.iter().find(|w| w.window.worker_id == 1).unwrap();
        assert_eq!(w1.stop, StopReason::Failed);
        assert_eq!(w1.records, 15);
        assert_eq!(w1.error.as_deref(), Some("HTTP 500"));
        let w2 = outcome.workers.iter().find(|w| w.window.worker_id == 2).unwrap();
        assert_eq!(w2.stop, StopReason::WindowFilled);
        assert_eq!(outcome.records.len(), 35);
        // no retry on a fatal status
        let calls_at_15 = fake.calls().iter().filter(|r| r.param_usize("offset") == 15).count();
        assert_eq!(calls_at_15, 1);
    }

    #[tokio::test]
    async fn transport_error_aborts_worker() {
        let transport = FakeTransport::new(|_: &Request| Err(TransportError::Timeout));
        let outcome = run(transport, vec![PageWindow::unbounded(1, 0)], 10).await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.workers[0].stop, StopReason::Failed);
    }

    #[tokio::test]
    async fn requests_carry_user_and_bounded_limit() {
        let fake = Arc::new(dataset(100, |limit| limit));
        OffsetPager::new(fake.clone())
            .with_settings(fast_settings(500))
            .fetch::<Value>("http://fake/x", "0xabc", vec![PageWindow::bounded(1, 0, 30)], "test")
            .await;
        let calls = fake.calls();
        assert_eq!(calls[0].param("user"), Some("0xabc"));
        assert_eq!(calls[0].param("limit"), Some("30"));
    }

    #[tokio::test]
    async fn malformed_body_is_fatal() {
        let transport = FakeTransport::new(|_: &Request| ok(json!({"error": "nope"})));
        let outcome = run(transport, vec![PageWindow::unbounded(1, 0)], 10).await;
        assert_eq!(outcome.workers[0].stop, StopReason::Failed);
    }

    #[tokio::test]
    async fn progress_reports_worker_completion() {
        let (progress, rx) = Progress::channel("idle");
        OffsetPager::new(Arc::new(dataset(10, |limit| limit)))
            .with_settings(fast_settings(5))
            .with_progress(progress)
            .fetch::<Value>("http://fake/x", "0xuser", PageWindow::partition(0, 10, 2), "Closed positions")
            .await;
        assert_eq!(*rx.borrow(), "Closed positions (2/2 workers)");
    }
}
