//! Streaming anomaly detection for sensor time series
//!
//! This crate provides the core functionality for:
//! - Consuming jobs from an input stream and publishing results
//! - Per-metric isolation forest detection and severity tiers
//! - Model artifact persistence
//! - Health checks and observability

pub mod anomaly;
pub mod api;
pub mod errors;
pub mod health;
pub mod models;
pub mod observability;
pub mod processor;
pub mod store;
pub mod stream;

pub use errors::{
    DecodeError, DetectionError, PersistError, PublishError, TransportError, WorkerError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{StructuredLogger, WorkerMetrics};
pub use processor::{JobOutcome, JobProcessor};
pub use store::{FileModelStore, ModelArtifact, ModelStore, SavedArtifact, SlotNaming};
