//! JSON payloads carried in stream entries

use crate::errors::DecodeError;
use crate::models::{Job, JobResult};

/// Decode a job, requiring a non-empty `metrics` list
pub fn decode_job(payload: &str) -> Result<Job, DecodeError> {
    let job: Job = serde_json::from_str(payload)?;
    if job.samples.is_empty() {
        return Err(DecodeError::EmptyMetrics(job.job_id));
    }
    Ok(job)
}

pub fn encode_result(result: &JobResult) -> Result<String, serde_json::Error> {
    serde_json::to_string(result)
}
