//! Integration tests for the dispatcher.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use keygate::engine::{Dispatcher, Submission};
use keygate::error::{BoxError, Error};
use keygate::model::Outcome;
use keygate::processor::{FailureObserver, Processor};
use tokio::sync::Semaphore;

const THREAD_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StringKey(String);

fn key(s: &str) -> StringKey {
    StringKey(s.to_string())
}

fn constant_key() -> StringKey {
    key("A000000000")
}

fn random_key() -> StringKey {
    StringKey(uuid::Uuid::new_v4().to_string())
}

// ---------------------------------------------------------------------------
// Collaborator doubles
// ---------------------------------------------------------------------------

/// Fails when reentered for a key it is already processing, like a
/// non-reentrant external system. Tracks overlaps and peak concurrency.
#[derive(Default)]
struct ReentrancyDetector {
    in_progress: Mutex<HashMap<StringKey, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
    work: Duration,
}

impl ReentrancyDetector {
    fn with_work(work: Duration) -> Self {
        Self {
            work,
            ..Default::default()
        }
    }
}

impl Processor<StringKey> for ReentrancyDetector {
    async fn process(&self, key: &StringKey) -> Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_progress = self.in_progress.lock().unwrap();
            let count = in_progress.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                *count -= 1;
                self.overlaps.fetch_add(1, Ordering::SeqCst);
                return Err(format!("reentered for {key:?}").into());
            }
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let mut in_progress = self.in_progress.lock().unwrap();
        if let Some(count) = in_progress.get_mut(key) {
            *count -= 1;
        }
        Ok(())
    }
}

struct FailingProcessor;

impl Processor<StringKey> for FailingProcessor {
    async fn process(&self, key: &StringKey) -> Result<(), BoxError> {
        Err(format!("cannot process {key:?}").into())
    }
}

struct PanickingProcessor;

impl Processor<StringKey> for PanickingProcessor {
    async fn process(&self, _key: &StringKey) -> Result<(), BoxError> {
        panic!("processor exploded");
    }
}

/// Blocks every call until the test adds a permit.
struct HoldingProcessor {
    permits: Semaphore,
}

impl HoldingProcessor {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }
}

impl Processor<StringKey> for HoldingProcessor {
    async fn process(&self, _key: &StringKey) -> Result<(), BoxError> {
        self.permits.acquire().await?.forget();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    keys: Mutex<Vec<StringKey>>,
}

impl RecordingObserver {
    fn managed(&self) -> Vec<StringKey> {
        self.keys.lock().unwrap().clone()
    }
}

impl FailureObserver<StringKey> for RecordingObserver {
    fn manage(&self, key: &StringKey) {
        self.keys.lock().unwrap().push(key.clone());
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Capture log output on the current thread. Only meaningful on a
/// current-thread runtime, where dispatch tasks run on this thread too.
fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}

async fn outcomes(submissions: Vec<Submission<StringKey>>) -> Vec<Outcome<StringKey>> {
    let mut out = Vec::with_capacity(submissions.len());
    for submission in submissions {
        out.push(submission.outcome().await.unwrap());
    }
    out
}

/// Call `handle` from `THREAD_COUNT` OS threads released together by a barrier.
fn handle_from_threads(
    dispatcher: &Dispatcher<StringKey, Arc<ReentrancyDetector>>,
    make_key: fn() -> StringKey,
) -> Vec<Submission<StringKey>> {
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let threads: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let key = make_key();
                barrier.wait();
                dispatcher.handle(key)
            })
        })
        .collect();

    threads.into_iter().map(|t| t.join().unwrap()).collect()
}

fn multi_thread_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(THREAD_COUNT)
        .enable_all()
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Outcome reporting
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "current_thread")]
async fn failing_processor_reports_key_to_observer_once() {
    let (logs, _guard) = capture_logs();
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher =
        Dispatcher::with_observer(FailingProcessor, Arc::clone(&observer)).unwrap();

    let outcome = dispatcher.handle(key("A")).outcome().await.unwrap();

    assert!(!outcome.is_processed());
    assert_eq!(outcome.key(), &key("A"));
    assert!(matches!(outcome.cause(), Some(Error::Processor(_))));
    assert_eq!(observer.managed(), vec![key("A")]);
    assert!(!dispatcher.is_reserved(&key("A")));

    let logs = logs.contents();
    assert!(logs.contains("key was not processed"), "logs: {logs}");
    assert!(logs.contains(r#"StringKey("A")"#), "logs: {logs}");
}

#[tokio::test(flavor = "current_thread")]
async fn successful_key_logs_success_and_skips_observer() {
    let (logs, _guard) = capture_logs();
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::with_observer(
        ReentrancyDetector::with_work(Duration::from_millis(1)),
        Arc::clone(&observer),
    )
    .unwrap();

    let outcome = dispatcher.handle(key("X")).outcome().await.unwrap();

    assert!(outcome.is_processed());
    assert!(outcome.cause().is_none());
    assert!(observer.managed().is_empty());

    let logs = logs.contents();
    assert!(logs.contains("key processed successfully"), "logs: {logs}");
    assert!(logs.contains(r#"StringKey("X")"#), "logs: {logs}");
    assert!(!logs.contains("key was not processed"), "logs: {logs}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_without_observer_still_reports_failure() {
    let dispatcher = Dispatcher::new(FailingProcessor).unwrap();

    let outcome = dispatcher.handle(key("B")).outcome().await.unwrap();

    assert_eq!(outcome.label(), "failed");
    assert_eq!(dispatcher.in_flight(), 0);
}

// ---------------------------------------------------------------------------
// Mutual exclusion and isolation
// ---------------------------------------------------------------------------

#[test]
fn detector_rejects_unguarded_concurrent_equal_keys() {
    let rt = multi_thread_runtime();
    let detector = Arc::new(ReentrancyDetector::with_work(Duration::from_millis(50)));

    let results = rt.block_on(async {
        let tasks: Vec<_> = (0..THREAD_COUNT)
            .map(|_| {
                let detector = Arc::clone(&detector);
                tokio::spawn(async move { detector.process(&constant_key()).await.is_ok() })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    });

    assert!(results.iter().any(|ok| *ok));
    assert!(detector.overlaps.load(Ordering::SeqCst) > 0);
}

#[test]
fn equal_keys_from_many_threads_never_overlap() {
    let rt = multi_thread_runtime();
    let detector = Arc::new(ReentrancyDetector::with_work(Duration::from_millis(20)));
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::builder(Arc::clone(&detector))
        .failure_observer(Arc::clone(&observer))
        .runtime(rt.handle().clone())
        .build()
        .unwrap();

    let submissions = handle_from_threads(&dispatcher, constant_key);
    let outcomes = rt.block_on(outcomes(submissions));

    assert_eq!(outcomes.len(), THREAD_COUNT);
    assert!(outcomes.iter().all(Outcome::is_processed));
    assert_eq!(detector.calls.load(Ordering::SeqCst), THREAD_COUNT);
    assert_eq!(detector.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(detector.peak.load(Ordering::SeqCst), 1);
    assert!(observer.managed().is_empty());
    assert!(!dispatcher.is_reserved(&constant_key()));
}

#[test]
fn distinct_keys_from_many_threads_run_in_parallel() {
    let rt = multi_thread_runtime();
    let detector = Arc::new(ReentrancyDetector::with_work(Duration::from_millis(200)));
    let dispatcher = Dispatcher::builder(Arc::clone(&detector))
        .runtime(rt.handle().clone())
        .build()
        .unwrap();

    let submissions = handle_from_threads(&dispatcher, random_key);
    let outcomes = rt.block_on(outcomes(submissions));

    assert!(outcomes.iter().all(Outcome::is_processed));
    assert_eq!(detector.overlaps.load(Ordering::SeqCst), 0);
    assert!(
        detector.peak.load(Ordering::SeqCst) > 1,
        "distinct keys should overlap"
    );
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn intermixed_keys_all_complete_without_overlap() {
    let detector = Arc::new(ReentrancyDetector::with_work(Duration::from_millis(5)));
    let dispatcher = Dispatcher::new(Arc::clone(&detector)).unwrap();

    let submissions: Vec<_> = (0..6 * THREAD_COUNT)
        .map(|i| {
            let key = if i % 2 == 0 { constant_key() } else { random_key() };
            dispatcher.handle(key)
        })
        .collect();

    let outcomes = tokio::time::timeout(Duration::from_secs(30), outcomes(submissions))
        .await
        .expect("every submission should complete");

    assert_eq!(outcomes.len(), 6 * THREAD_COUNT);
    assert!(outcomes.iter().all(Outcome::is_processed));
    assert_eq!(detector.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equal_keys_are_processed_once_per_submission() {
    let detector = Arc::new(ReentrancyDetector::with_work(Duration::from_millis(1)));
    let dispatcher = Dispatcher::new(Arc::clone(&detector)).unwrap();

    let submissions: Vec<_> = (0..5).map(|_| dispatcher.handle(key("dup"))).collect();
    outcomes(submissions).await;

    // No dedup: five submissions, five calls.
    assert_eq!(detector.calls.load(Ordering::SeqCst), 5);
}

// ---------------------------------------------------------------------------
// Release on every path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_key_is_released_for_next_submission() {
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher =
        Dispatcher::with_observer(FailingProcessor, Arc::clone(&observer)).unwrap();

    for _ in 0..3 {
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.handle(key("again")).outcome(),
        )
        .await
        .expect("released key must not deadlock")
        .unwrap();
        assert!(!outcome.is_processed());
        assert!(!dispatcher.is_reserved(&key("again")));
    }

    assert_eq!(observer.managed().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processor_panic_becomes_failure_and_releases_key() {
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher =
        Dispatcher::with_observer(PanickingProcessor, Arc::clone(&observer)).unwrap();

    let first = dispatcher.handle(key("P"));
    let second = dispatcher.handle(key("P"));

    for submission in [first, second] {
        let outcome = submission.outcome().await.unwrap();
        match outcome.cause() {
            Some(Error::ProcessorPanicked(msg)) => assert!(msg.contains("processor exploded")),
            other => panic!("expected ProcessorPanicked, got {other:?}"),
        }
    }

    assert_eq!(observer.managed(), vec![key("P"), key("P")]);
    assert!(!dispatcher.is_reserved(&key("P")));
}

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_waiting_submission() {
    let processor = Arc::new(HoldingProcessor::new());
    let observer = Arc::new(RecordingObserver::default());
    let dispatcher = Dispatcher::builder(Arc::clone(&processor))
        .failure_observer(Arc::clone(&observer))
        .build()
        .unwrap();

    let holder = dispatcher.handle(key("S"));
    while !dispatcher.is_reserved(&key("S")) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let waiter = dispatcher.handle(key("S"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "waiter must block on the reserved key");

    dispatcher.shutdown();
    assert!(dispatcher.is_shut_down());

    let interrupted = tokio::time::timeout(Duration::from_secs(5), waiter.outcome())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(interrupted.cause(), Some(Error::Interrupted)));
    assert_eq!(observer.managed(), vec![key("S")]);

    // The holder is unaffected and still owns the key.
    assert!(dispatcher.is_reserved(&key("S")));
    processor.permits.add_permits(1);
    let held = holder.outcome().await.unwrap();
    assert!(held.is_processed());
    assert!(!dispatcher.is_reserved(&key("S")));

    // Free keys still run after shutdown.
    processor.permits.add_permits(1);
    let late = dispatcher.handle(key("T")).outcome().await.unwrap();
    assert!(late.is_processed());
    assert_eq!(observer.managed().len(), 1);
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[test]
fn build_outside_runtime_without_handle_fails() {
    let result = Dispatcher::<StringKey, _>::new(FailingProcessor);
    assert!(matches!(result, Err(Error::NoRuntime)));
}

#[test]
fn handle_returns_without_waiting_for_processing() {
    let rt = multi_thread_runtime();
    let processor = Arc::new(HoldingProcessor::new());
    let dispatcher = Dispatcher::builder(Arc::clone(&processor))
        .runtime(rt.handle().clone())
        .build()
        .unwrap();

    // Processing is blocked, yet every call returns.
    let submissions: Vec<_> = (0..4).map(|_| dispatcher.handle(key("slow"))).collect();
    assert!(submissions.iter().all(|s| !s.is_finished()));

    processor.permits.add_permits(4);
    let outcomes = rt.block_on(outcomes(submissions));
    assert!(outcomes.iter().all(Outcome::is_processed));
}
