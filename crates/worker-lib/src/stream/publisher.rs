//! Result publication

use super::codec::encode_result;
use super::{EntryId, StreamTransport};
use crate::errors::PublishError;
use crate::models::JobResult;
use std::sync::Arc;

/// Output stream settings
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub output_stream: String,
    /// Entry field holding the JSON result
    pub payload_field: String,
    /// Approximate trim length of the output stream, `None` to keep everything
    pub max_len: Option<usize>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            output_stream: "ml_output".to_string(),
            payload_field: "data".to_string(),
            max_len: Some(500),
        }
    }
}

/// Appends each job result as one entry of the output stream
pub struct ResultPublisher {
    transport: Arc<dyn StreamTransport>,
    config: PublisherConfig,
}

impl ResultPublisher {
    pub fn new(transport: Arc<dyn StreamTransport>, config: PublisherConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub async fn publish(&self, result: &JobResult) -> Result<EntryId, PublishError> {
        let payload = encode_result(result)?;
        let id = self
            .transport
            .append(
                &self.config.output_stream,
                &[(self.config.payload_field.as_str(), payload.as_str())],
                self.config.max_len,
            )
            .await?;
        Ok(id)
    }
}
