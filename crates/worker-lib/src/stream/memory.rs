//! In-process stream transport

use super::{EntryId, StreamEntry, StreamTransport};
use crate::errors::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    streams: HashMap<String, VecDeque<StreamEntry>>,
    last_id: EntryId,
    available: bool,
    failing_reads: usize,
}

/// Memory-backed transport with Redis-like id semantics
///
/// Ids are derived from wall-clock milliseconds and always increase across
/// all streams. Connectivity can be toggled to exercise the consumer's
/// backoff path.
pub struct MemoryStream {
    state: Mutex<State>,
    appended: Notify,
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStream {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                available: true,
                ..State::default()
            }),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate the server going away or coming back
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
        self.appended.notify_waiters();
    }

    /// Make the next `n` reads fail with a connection error
    pub fn fail_reads(&self, n: usize) {
        self.lock().failing_reads = n;
    }

    /// Snapshot of a stream's entries, oldest first
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(stream)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, stream: &str) -> usize {
        self.lock().streams.get(stream).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    fn next_id(state: &mut State) -> EntryId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now > state.last_id.ms {
            EntryId::new(now, 0)
        } else {
            EntryId::new(state.last_id.ms, state.last_id.seq + 1)
        };
        state.last_id = id;
        id
    }

    fn collect_after(state: &State, stream: &str, after: EntryId, count: usize) -> Vec<StreamEntry> {
        state
            .streams
            .get(stream)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.id > after)
                    .take(count)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn offline() -> TransportError {
    TransportError::Unreachable("memory stream offline".to_string())
}

#[async_trait]
impl StreamTransport for MemoryStream {
    async fn tail(&self, stream: &str) -> Result<EntryId, TransportError> {
        let state = self.lock();
        if !state.available {
            return Err(offline());
        }
        Ok(state
            .streams
            .get(stream)
            .and_then(|entries| entries.back())
            .map_or(EntryId::ZERO, |e| e.id))
    }

    async fn read(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, TransportError> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            // Register interest before checking so an append in between is not missed
            let notified = self.appended.notified();
            {
                let mut state = self.lock();
                if state.failing_reads > 0 {
                    state.failing_reads -= 1;
                    return Err(offline());
                }
                if !state.available {
                    return Err(offline());
                }
                let batch = Self::collect_after(&state, stream, after, count);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, TransportError> {
        let id = {
            let mut state = self.lock();
            if !state.available {
                return Err(offline());
            }
            let id = Self::next_id(&mut state);
            let entries = state.streams.entry(stream.to_string()).or_default();
            entries.push_back(StreamEntry {
                id,
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
            if let Some(max_len) = max_len {
                while entries.len() > max_len {
                    entries.pop_front();
                }
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let stream = MemoryStream::new();
        let a = stream.append("s", &[("data", "1")], None).await.unwrap();
        let b = stream.append("s", &[("data", "2")], None).await.unwrap();
        assert!(b > a);
        assert_eq!(stream.tail("s").await.unwrap(), b);
        assert_eq!(stream.tail("other").await.unwrap(), EntryId::ZERO);
    }

    #[tokio::test]
    async fn test_read_after_cursor() {
        let stream = MemoryStream::new();
        let first = stream.append("s", &[("data", "1")], None).await.unwrap();
        stream.append("s", &[("data", "2")], None).await.unwrap();
        stream.append("s", &[("data", "3")], None).await.unwrap();

        let batch = stream
            .read("s", first, 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].field("data"), Some("2"));
    }

    #[tokio::test]
    async fn test_read_times_out_empty() {
        let stream = MemoryStream::new();
        let batch = stream
            .read("s", EntryId::ZERO, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let stream = Arc::new(MemoryStream::new());
        let reader = {
            let stream = Arc::clone(&stream);
            tokio::spawn(async move {
                stream
                    .read("s", EntryId::ZERO, 10, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.append("s", &[("data", "x")], None).await.unwrap();

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_trims_to_max_len() {
        let stream = MemoryStream::new();
        for i in 0..10 {
            let value = i.to_string();
            stream.append("s", &[("data", value.as_str())], Some(3)).await.unwrap();
        }
        let entries = stream.entries("s");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("data"), Some("7"));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let stream = MemoryStream::new();
        stream.fail_reads(1);
        let err = stream
            .read("s", EntryId::ZERO, 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_connection());
        assert!(stream
            .read("s", EntryId::ZERO, 1, Duration::ZERO)
            .await
            .is_ok());

        stream.set_available(false);
        assert!(stream.tail("s").await.is_err());
        assert!(stream.append("s", &[], None).await.is_err());
    }
}
