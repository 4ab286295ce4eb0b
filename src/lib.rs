//! # keygate
//!
//! Keyed mutual-exclusion dispatcher. Keys are handed off asynchronously;
//! two equal keys are never processed at the same time, while distinct keys
//! run in parallel on the tokio runtime.
//!
//! ```no_run
//! use keygate::engine::Dispatcher;
//! use keygate::error::BoxError;
//! use keygate::processor::Processor;
//!
//! struct Printer;
//!
//! impl Processor<String> for Printer {
//!     async fn process(&self, key: &String) -> Result<(), BoxError> {
//!         println!("processing {key}");
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> keygate::error::Result<()> {
//! let dispatcher = Dispatcher::new(Printer)?;
//! dispatcher.handle("A".to_string());
//! dispatcher.handle("A".to_string()); // runs after the first one
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod processor;
pub mod telemetry;
