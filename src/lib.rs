use std::future::Future;
use std::pin::Pin;

/// Error types for the tailing pipeline
pub mod error;

/// Core data model
pub mod events;

/// Configuration management
pub mod config;

/// Server directory and event store seams
pub mod storage;

/// File followers and their supervisor
pub mod collectors;

/// Line-to-chunk segmentation
pub mod aggregator;

/// Error threshold monitoring
pub mod triggers;

/// Chunk enrichment through the external services
pub mod analysis;

/// Debounced alert mails
pub mod alerts;

/// Self-monitoring counters
pub mod monitoring;

/// Wiring of the components into a running pipeline
pub mod pipeline;

/// Boxed future returned by the trait seams
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Re-export commonly used types
pub use error::{AlertError, AnalysisError, ConfigError, StoreError, TailError};
pub use pipeline::{Pipeline, PipelineParts};
