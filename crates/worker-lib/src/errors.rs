//! Error types, one per failure class of the pipeline
//!
//! Each class is contained at its own unit of work: a transport error at
//! the poll, a decode error at the message, a detection error at the metric
//! type, a persist error at the artifact write, a publish error at the job.

use crate::models::MetricType;
use std::path::PathBuf;
use thiserror::Error;

/// Stream server could not be reached or rejected a command
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("stream server unreachable: {0}")]
    Unreachable(String),

    #[error("stream command failed: {0}")]
    Command(String),

    #[error("invalid stream entry id: {0}")]
    InvalidEntryId(String),
}

impl TransportError {
    /// Connection-level failures, as opposed to a rejected command
    pub fn is_connection(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// Malformed or incomplete job payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("entry has no '{0}' field")]
    MissingField(String),

    #[error("invalid job payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job {0} has an empty metrics list")]
    EmptyMetrics(String),
}

/// Fitting or scoring one metric type failed
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("{metric_type}: need at least {required} samples, got {actual}")]
    InsufficientSamples {
        metric_type: MetricType,
        required: usize,
        actual: usize,
    },

    #[error("{0}: fewer than 2 distinct values")]
    Degenerate(MetricType),

    #[error("{0}: input contains a non-finite value")]
    NonFinite(MetricType),

    #[error("{0}: value range exceeds f64")]
    RangeOverflow(MetricType),

    #[error("invalid detector parameter: {0}")]
    InvalidParameter(String),
}

/// Writing a model artifact failed
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize model artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Appending a job result to the output stream failed
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to encode job result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to append job result: {0}")]
    Transport(#[from] TransportError),
}

/// Failure while handling one stream entry
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("job processing aborted: {0}")]
    Processing(String),

    #[error(transparent)]
    Publish(#[from] PublishError),
}
