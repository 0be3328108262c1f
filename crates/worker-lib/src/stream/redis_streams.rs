//! Redis Streams transport
//!
//! `XREAD COUNT n BLOCK ms` for polling, `XADD [MAXLEN ~ n]` for appends and
//! `XREVRANGE + - COUNT 1` to find the tail. The connection is opened lazily
//! and dropped after any connection-level failure so the next call redials.

use super::{EntryId, StreamEntry, StreamTransport};
use crate::errors::TransportError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

impl From<RedisError> for TransportError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            TransportError::Unreachable(e.to_string())
        } else {
            TransportError::Command(e.to_string())
        }
    }
}

pub struct RedisStreams {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStreams {
    /// Parse `url`; no connection is made until the first command
    pub fn open(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url)
            .map_err(|e| TransportError::Command(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, TransportError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Connecting to redis");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection after a connection-level failure
    async fn check<T>(&self, result: Result<T, RedisError>) -> Result<T, TransportError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = TransportError::from(e);
                if err.is_connection() {
                    self.connection.lock().await.take();
                }
                Err(err)
            }
        }
    }
}

fn to_entry(raw: StreamId) -> Result<StreamEntry, TransportError> {
    let id = raw.id.parse()?;
    let fields = raw
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|v| (k.clone(), v))
        })
        .collect::<HashMap<_, _>>();
    Ok(StreamEntry { id, fields })
}

#[async_trait]
impl StreamTransport for RedisStreams {
    async fn tail(&self, stream: &str) -> Result<EntryId, TransportError> {
        let mut conn = self.connection().await?;
        let reply: Result<StreamRangeReply, _> = conn.xrevrange_count(stream, "+", "-", 1).await;
        let reply = self.check(reply).await?;

        match reply.ids.into_iter().next() {
            Some(newest) => newest.id.parse(),
            None => Ok(EntryId::ZERO),
        }
    }

    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let mut conn = self.connection().await?;
        let options = StreamReadOptions::default()
            .count(count)
            .block(block.as_millis() as usize);
        let cursor = after.to_string();

        // A BLOCK that times out replies nil
        let reply: Result<Option<StreamReadReply>, _> =
            conn.xread_options(&[stream], &[cursor.as_str()], &options).await;
        let Some(reply) = self.check(reply).await? else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .filter(|key| key.key == stream)
            .flat_map(|key| key.ids)
            .map(to_entry)
            .collect()
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, TransportError> {
        let mut conn = self.connection().await?;
        let reply: Result<String, _> = match max_len {
            Some(n) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", fields)
                    .await
            }
            None => conn.xadd(stream, "*", fields).await,
        };
        self.check(reply).await?.parse()
    }
}
