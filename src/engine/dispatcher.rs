//! Dispatcher: accepts keys, runs each one through the reservation gate and
//! the processor on its own task, and reports the outcome.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, error, info, warn};

use crate::error::{Error, ProcessingFailed, Result};
use crate::model::{Key, Outcome, SubmissionId};
use crate::processor::{FailureObserver, Processor};
use crate::telemetry::dispatch::{record_state_transition, start_dispatch_span};
use crate::telemetry::metrics;

use super::reservation::ReservationSet;

/// Runs keys through a processor, never two equal keys at once.
///
/// Cloning is cheap and every clone shares the same reservation set.
pub struct Dispatcher<K: Key, P> {
    processor: Arc<P>,
    observer: Option<Arc<dyn FailureObserver<K>>>,
    reservations: Arc<ReservationSet<K>>,
    runtime: Handle,
}

impl<K: Key, P> Clone for Dispatcher<K, P> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            observer: self.observer.clone(),
            reservations: Arc::clone(&self.reservations),
            runtime: self.runtime.clone(),
        }
    }
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder<K: Key, P> {
    processor: P,
    observer: Option<Arc<dyn FailureObserver<K>>>,
    runtime: Option<Handle>,
}

impl<K: Key, P: Processor<K>> DispatcherBuilder<K, P> {
    /// Register the sink told about keys that could not be processed.
    pub fn failure_observer(mut self, observer: impl FailureObserver<K> + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Spawn dispatch tasks on this runtime instead of the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the dispatcher. Without an explicit runtime this must be
    /// called from inside a tokio runtime.
    pub fn build(self) -> Result<Dispatcher<K, P>> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| Error::NoRuntime)?,
        };

        Ok(Dispatcher {
            processor: Arc::new(self.processor),
            observer: self.observer,
            reservations: Arc::new(ReservationSet::new()),
            runtime,
        })
    }
}

impl<K: Key, P: Processor<K>> Dispatcher<K, P> {
    /// Start building a dispatcher around `processor`.
    pub fn builder(processor: P) -> DispatcherBuilder<K, P> {
        DispatcherBuilder {
            processor,
            observer: None,
            runtime: None,
        }
    }

    /// Dispatcher without a failure observer, on the current runtime.
    pub fn new(processor: P) -> Result<Self> {
        Self::builder(processor).build()
    }

    /// Dispatcher with a failure observer, on the current runtime.
    pub fn with_observer(
        processor: P,
        observer: impl FailureObserver<K> + 'static,
    ) -> Result<Self> {
        Self::builder(processor).failure_observer(observer).build()
    }

    /// Submit `key` for processing and return immediately.
    ///
    /// If an equal key is in flight, the spawned task waits for it to be
    /// released first. Failures are logged and passed to the failure
    /// observer, never returned here. The returned handle may be dropped.
    pub fn handle(&self, key: K) -> Submission<K> {
        let id = SubmissionId::new();
        metrics::dispatch_submitted().add(1, &[]);

        let this = self.clone();
        let task = self.runtime.spawn(async move { this.run(id, key).await });

        Submission { id, task }
    }

    /// Whether an equal key is currently being processed.
    pub fn is_reserved(&self, key: &K) -> bool {
        self.reservations.contains(key)
    }

    /// Number of keys currently being processed.
    pub fn in_flight(&self) -> usize {
        self.reservations.len()
    }

    /// Interrupt every submission waiting for a key, now or later. They
    /// fail with [`Error::Interrupted`]. Submissions whose key is free still
    /// run, and keys already being processed finish normally.
    pub fn shutdown(&self) {
        info!(in_flight = self.in_flight(), "dispatcher shutting down");
        self.reservations.interrupt();
    }

    pub fn is_shut_down(&self) -> bool {
        self.reservations.is_interrupted()
    }

    async fn run(&self, id: SubmissionId, key: K) -> Outcome<K> {
        let submitted_at = Utc::now();
        let start = Instant::now();
        let span = start_dispatch_span(id, &key);

        let result = self
            .dispatch(&key, &span)
            .instrument(span.clone())
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(()) => Outcome::Processed {
                id,
                key,
                submitted_at,
                duration_ms,
            },
            Err(cause) => Outcome::Failed {
                id,
                failure: ProcessingFailed::new(key, cause),
                submitted_at,
                duration_ms,
            },
        };

        span.in_scope(|| self.report(&outcome));
        outcome
    }

    /// Gate, call, release. The reservation is dropped before this returns
    /// on every path.
    async fn dispatch(&self, key: &K, span: &Span) -> Result<()> {
        let wait_start = Instant::now();
        let contended = self.reservations.contains(key);
        if contended {
            metrics::gate_contended().add(1, &[]);
            record_state_transition(span, "submitted", "waiting");
        }

        let reservation = self.reservations.reserve(key).await?;
        metrics::gate_wait_ms().record(wait_start.elapsed().as_secs_f64() * 1000.0, &[]);
        let from = if contended { "waiting" } else { "submitted" };
        record_state_transition(span, from, "reserved");

        let result = self.call_processor(key).await;

        drop(reservation);
        record_state_transition(span, "reserved", "released");
        result
    }

    /// Run the processor on its own task so a panic surfaces as a
    /// `JoinError` instead of unwinding through the gate.
    async fn call_processor(&self, key: &K) -> Result<()> {
        let processor = Arc::clone(&self.processor);
        let key = key.clone();

        match tokio::spawn(async move { processor.process(&key).await }).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Processor(e)),
            Err(e) if e.is_panic() => Err(Error::ProcessorPanicked(panic_message(e.into_panic()))),
            Err(e) => Err(Error::Task(e)),
        }
    }

    fn report(&self, outcome: &Outcome<K>) {
        let duration_ms = outcome.duration_ms();
        metrics::dispatch_duration_ms().record(duration_ms as f64, &[]);

        match outcome {
            Outcome::Processed { id, key, .. } => {
                metrics::dispatch_outcomes().add(
                    1,
                    &[
                        KeyValue::new("result", "processed"),
                        KeyValue::new("cause", "none"),
                    ],
                );
                info!(id = %id, key = ?key, duration_ms, "key processed successfully");
            }
            Outcome::Failed { id, failure, .. } => {
                metrics::dispatch_outcomes().add(
                    1,
                    &[
                        KeyValue::new("result", "failed"),
                        KeyValue::new("cause", failure.cause.kind()),
                    ],
                );
                error!(
                    id = %id,
                    key = ?failure.key,
                    error = %failure.cause,
                    duration_ms,
                    "key was not processed"
                );
                if let Some(observer) = &self.observer {
                    observer.manage(&failure.key);
                }
            }
        }
    }
}

impl<K: Key, P> fmt::Debug for Dispatcher<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.reservations.len())
            .field("has_observer", &self.observer.is_some())
            .field("interrupted", &self.reservations.is_interrupted())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Completion handle for one submission. Dropping it does not cancel the
/// submission.
pub struct Submission<K: Key> {
    id: SubmissionId,
    task: JoinHandle<Outcome<K>>,
}

impl<K: Key> Submission<K> {
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the submission to finish and return what happened to it.
    ///
    /// Only fails if the dispatch task itself died (e.g. the failure
    /// observer panicked or the runtime shut down).
    pub async fn outcome(self) -> Result<Outcome<K>> {
        match self.task.await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(id = %self.id, "dispatch task did not complete: {e}");
                Err(Error::Task(e))
            }
        }
    }
}

impl<K: Key> fmt::Debug for Submission<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("id", &self.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
