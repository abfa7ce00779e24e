use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ApiError;

use super::{RelayEnvelope, RelayProducer, RelayRecord, RelaySource};

#[derive(Default)]
struct Log {
    next_offset: i64,
    committed: Option<i64>,
}

/// Single-partition in-process broker for tests and single-instance runs.
pub struct MemoryBroker {
    topic: String,
    log: Arc<Mutex<Log>>,
    tx: mpsc::UnboundedSender<RelayRecord>,
}

/// Consumer end of a [`MemoryBroker`].
pub struct MemoryRelaySource {
    log: Arc<Mutex<Log>>,
    rx: mpsc::UnboundedReceiver<RelayRecord>,
}

impl MemoryBroker {
    pub fn new(topic: &str) -> (Self, MemoryRelaySource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Log::default()));
        let broker = Self {
            topic: topic.to_string(),
            log: Arc::clone(&log),
            tx,
        };
        (broker, MemoryRelaySource { log, rx })
    }

    /// Append raw bytes to the topic, bypassing serialization.
    pub fn publish_raw(&self, payload: Vec<u8>) -> Result<i64, ApiError> {
        let offset = {
            let mut log = self.log.lock();
            let offset = log.next_offset;
            log.next_offset += 1;
            offset
        };
        self.tx
            .send(RelayRecord {
                topic: self.topic.clone(),
                partition: 0,
                offset,
                payload,
            })
            .map_err(|_| ApiError::unavailable("Relay consumer is gone"))?;
        Ok(offset)
    }

    /// Highest committed offset, `None` before the first commit.
    pub fn committed_offset(&self) -> Option<i64> {
        self.log.lock().committed
    }

    pub fn published_count(&self) -> i64 {
        self.log.lock().next_offset
    }
}

#[async_trait]
impl RelayProducer for MemoryBroker {
    async fn publish(&self, envelope: &RelayEnvelope) -> Result<(), ApiError> {
        let payload = serde_json::to_vec(envelope)?;
        self.publish_raw(payload)?;
        Ok(())
    }
}

#[async_trait]
impl RelaySource for MemoryRelaySource {
    async fn recv(&mut self) -> Result<Option<RelayRecord>, ApiError> {
        Ok(self.rx.recv().await)
    }

    async fn commit(&mut self, record: &RelayRecord) -> Result<(), ApiError> {
        let mut log = self.log.lock();
        log.committed = Some(log.committed.map_or(record.offset, |c| c.max(record.offset)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commits_track_the_highest_offset() {
        let (broker, mut source) = MemoryBroker::new("chat-messages");
        broker.publish_raw(b"a".to_vec()).unwrap();
        broker.publish_raw(b"b".to_vec()).unwrap();

        let first = source.recv().await.unwrap().unwrap();
        let second = source.recv().await.unwrap().unwrap();
        assert_eq!((first.offset, second.offset), (0, 1));
        assert_eq!(broker.committed_offset(), None);

        source.commit(&second).await.unwrap();
        source.commit(&first).await.unwrap();
        assert_eq!(broker.committed_offset(), Some(1));
    }
}
