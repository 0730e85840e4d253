use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::PartitionReader;
use crate::message::{Offset, RawRecord};
use crate::{Error, Result};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Partition {
    records: VecDeque<RawRecord>,
    /// Offsets below this were compacted away.
    retained_from: Offset,
}

impl Partition {
    fn next_offset(&self) -> Offset {
        self.records
            .back()
            .map_or(self.retained_from, |record| record.offset + 1)
    }

    fn earliest(&self) -> Offset {
        self.records
            .front()
            .map_or(self.retained_from, |record| record.offset)
    }

    fn read(&self, from: Offset, max_batch: usize) -> Result<Vec<RawRecord>> {
        if from < self.retained_from {
            return Err(Error::OffsetOutOfRange {
                requested: from,
                earliest: self.earliest(),
            });
        }
        let start = self.records.partition_point(|record| record.offset < from);
        Ok(self
            .records
            .iter()
            .skip(start)
            .take(max_batch)
            .cloned()
            .collect())
    }
}

/// MemoryLog keeps partitions in memory. A fetch on a partition with nothing new waits for an
/// append for up to the poll timeout before returning an empty batch.
///
/// Partitions are created on first use and start empty.
#[derive(Debug)]
pub struct MemoryLog {
    partitions: RwLock<HashMap<(String, u32), Partition>>,
    appended: Notify,
    poll_timeout: Duration,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_TIMEOUT)
    }
}

impl MemoryLog {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            appended: Notify::new(),
            poll_timeout,
        }
    }

    /// Appends a payload at the next offset of the partition and returns that offset.
    pub fn append(&self, topic: &str, partition: u32, payload: impl Into<Bytes>) -> Offset {
        let offset = {
            let mut partitions = self.partitions.write();
            let partition = partitions
                .entry((topic.to_string(), partition))
                .or_default();
            let offset = partition.next_offset();
            partition.records.push_back(RawRecord::new(offset, payload));
            offset
        };
        self.appended.notify_waiters();
        offset
    }

    /// Appends a record with an explicit offset, which must be beyond every offset already in
    /// the partition. Gaps are allowed.
    pub fn append_record(&self, topic: &str, partition: u32, record: RawRecord) -> Result<()> {
        {
            let mut partitions = self.partitions.write();
            let partition = partitions
                .entry((topic.to_string(), partition))
                .or_default();
            let next = partition.next_offset();
            if record.offset < next {
                return Err(Error::Internal(format!(
                    "cannot append offset {} to {topic}, next offset is {next}",
                    record.offset
                )));
            }
            partition.records.push_back(record);
        }
        self.appended.notify_waiters();
        Ok(())
    }

    /// Drops every record below `before`. Fetching from a compacted offset fails with
    /// [Error::OffsetOutOfRange].
    pub fn compact(&self, topic: &str, partition: u32, before: Offset) {
        let mut partitions = self.partitions.write();
        let partition = partitions
            .entry((topic.to_string(), partition))
            .or_default();
        while partition
            .records
            .front()
            .is_some_and(|record| record.offset < before)
        {
            partition.records.pop_front();
        }
        partition.retained_from = partition.retained_from.max(before);
    }

    fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max_batch: usize,
    ) -> Result<Vec<RawRecord>> {
        let partitions = self.partitions.read();
        match partitions.get(&(topic.to_string(), partition)) {
            Some(partition) => partition.read(from, max_batch),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl PartitionReader for MemoryLog {
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max_batch: usize,
    ) -> Result<Vec<RawRecord>> {
        // register interest before reading so an append between the read and the wait is not lost.
        let appended = self.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let records = self.read(topic, partition, from, max_batch)?;
        if !records.is_empty() {
            return Ok(records);
        }

        if tokio::time::timeout(self.poll_timeout, appended).await.is_err() {
            return Ok(Vec::new());
        }
        self.read(topic, partition, from, max_batch)
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        let partitions = self.partitions.read();
        Ok(partitions
            .get(&(topic.to_string(), partition))
            .map_or(0, Partition::earliest))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_fetch_in_order_with_batches() {
        let log = MemoryLog::default();
        for i in 0..5 {
            assert_eq!(log.append("t", 0, format!("m{i}")), i);
        }

        let batch = log.fetch("t", 0, 1, 3).await.unwrap();
        let offsets: Vec<Offset> = batch.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert_eq!(batch[0].payload, Bytes::from("m1"));

        let batch = log.fetch("t", 0, 4, 3).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_offsets_and_gaps() {
        let log = MemoryLog::default();
        log.append_record("t", 0, RawRecord::new(10, "a")).unwrap();
        log.append_record("t", 0, RawRecord::new(12, "b")).unwrap();
        assert!(log.append_record("t", 0, RawRecord::new(12, "c")).is_err());

        assert_eq!(log.earliest_offset("t", 0).await.unwrap(), 10);
        let offsets: Vec<Offset> = log
            .fetch("t", 0, 11, 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![12]);
        assert_eq!(log.append("t", 0, "d"), 13);
    }

    #[tokio::test]
    async fn test_compaction_out_of_range() {
        let log = MemoryLog::default();
        for _ in 0..10 {
            log.append("t", 0, "x");
        }
        log.compact("t", 0, 6);

        assert_eq!(log.earliest_offset("t", 0).await.unwrap(), 6);
        assert!(matches!(
            log.fetch("t", 0, 3, 10).await,
            Err(Error::OffsetOutOfRange {
                requested: 3,
                earliest: 6
            })
        ));
        assert_eq!(log.fetch("t", 0, 6, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_fetch_waits_for_poll_timeout() {
        let log = MemoryLog::new(Duration::from_millis(50));
        let start = Instant::now();
        assert!(log.fetch("t", 0, 0, 10).await.unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(log.earliest_offset("t", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_wakes_up_on_append() {
        let log = Arc::new(MemoryLog::new(Duration::from_secs(10)));
        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", 0, "late");
        });

        let start = Instant::now();
        let batch = log.fetch("t", 0, 0, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
