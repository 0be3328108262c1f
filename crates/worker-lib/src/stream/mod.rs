//! Stream transport and the consume/publish loop
//!
//! This module provides:
//! - `StreamTransport`: append-only, id-ordered log of field maps
//! - `MemoryStream`: in-process transport for tests and local runs
//! - `RedisStreams`: Redis Streams transport (feature `redis-streams`)
//! - `StreamConsumer`: polls jobs, runs the processor, publishes results

mod codec;
mod consumer;
mod memory;
mod publisher;
#[cfg(feature = "redis-streams")]
mod redis_streams;


pub use codec::{decode_job, encode_result};
pub use consumer::{ConsumerConfig, ConsumerStats, StreamConsumer, StreamConsumerBuilder};
pub use memory::MemoryStream;
pub use publisher::{PublisherConfig, ResultPublisher};
#[cfg(feature = "redis-streams")]
pub use redis_streams::RedisStreams;

use crate::errors::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Position of an entry in a stream: `<milliseconds>-<sequence>`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Origin of every stream, smaller than any real entry
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Append-only log of entries with monotonically increasing ids
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Id of the newest entry, or [`EntryId::ZERO`] for an empty stream
    async fn tail(&self, stream: &str) -> Result<EntryId, TransportError>;

    /// Up to `count` entries with id strictly greater than `after`, oldest
    /// first. Waits up to `block` for the first entry; an empty batch means
    /// the wait timed out.
    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError>;

    /// Append an entry, trimming the stream to roughly `max_len` entries
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, TransportError>;
}
