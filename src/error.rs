//! Error types for keygate.

use std::fmt;

use thiserror::Error;

/// Boxed error returned by processors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("interrupted while waiting for the key to be released")]
    Interrupted,

    #[error("processor failed: {0}")]
    Processor(#[source] BoxError),

    #[error("processor panicked: {0}")]
    ProcessorPanicked(String),

    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("no tokio runtime available to spawn dispatch tasks")]
    NoRuntime,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Short label used for the `cause` metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Interrupted => "interrupted",
            Error::Processor(_) => "processor",
            Error::ProcessorPanicked(_) => "panicked",
            Error::Task(_) => "task",
            Error::NoRuntime => "no_runtime",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

/// A key that could not be processed, together with what stopped it.
#[derive(Debug, Error)]
#[error("key {key:?} was not processed: {cause}")]
pub struct ProcessingFailed<K: fmt::Debug> {
    pub key: K,
    #[source]
    pub cause: Error,
}

impl<K: fmt::Debug> ProcessingFailed<K> {
    pub fn new(key: K, cause: Error) -> Self {
        Self { key, cause }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
