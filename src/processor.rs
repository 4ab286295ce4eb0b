//! Collaborator interfaces.
//!
//! A processor does the actual work for a key. It is not expected to be
//! reentrant for equal keys; the dispatcher guarantees it never has to be.
//! A failure observer is told about keys that could not be processed.

use std::future::Future;
use std::sync::Arc;

use crate::error::BoxError;

/// Performs the work for a key.
pub trait Processor<K>: Send + Sync + 'static {
    /// Process one key. May take arbitrarily long and may fail.
    fn process(&self, key: &K) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl<K, P> Processor<K> for Arc<P>
where
    P: Processor<K>,
{
    fn process(&self, key: &K) -> impl Future<Output = Result<(), BoxError>> + Send {
        (**self).process(key)
    }
}

/// Sink for keys whose processing failed.
///
/// Called at most once per failed submission, after the key's reservation
/// has been released.
pub trait FailureObserver<K>: Send + Sync {
    fn manage(&self, key: &K);
}

impl<K, O> FailureObserver<K> for Arc<O>
where
    O: FailureObserver<K> + ?Sized,
{
    fn manage(&self, key: &K) {
        (**self).manage(key)
    }
}
