use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};

use super::PartitionReader;
use crate::message::{Offset, RawRecord};
use crate::{Error, Result};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// One line of a segment file.
#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    offset: Offset,
    /// base64 encoded payload
    payload: String,
}

/// Where the last fetch of a partition stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadPosition {
    /// Offset following the last consumed line.
    next_offset: Offset,
    /// Byte position right after the last consumed line.
    byte: u64,
}

/// FileLog reads partitions stored as `<dir>/<topic>/<partition>.log`, one JSON object
/// `{"offset": n, "payload": "<base64>"}` per line.
///
/// A trailing line without a newline is treated as still being written and is not returned.
/// A missing segment file is an empty partition. Offsets are expected to increase along a
/// segment, which lets a fetch continue from the byte where the previous one stopped.
#[derive(Debug, Clone)]
pub struct FileLog {
    dir: PathBuf,
    poll_timeout: Duration,
    positions: Arc<Mutex<HashMap<(String, u32), ReadPosition>>>,
}

impl FileLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            positions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, topic: &str, partition: u32) -> PathBuf {
        self.dir.join(topic).join(format!("{partition}.log"))
    }

    /// Appends a record to the partition's segment file, creating it when needed.
    pub async fn append(&self, topic: &str, partition: u32, record: &RawRecord) -> Result<()> {
        let path = self.segment_path(topic, partition);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(&path, e))?;
        }

        let mut line = serde_json::to_vec(&LogLine {
            offset: record.offset,
            payload: BASE64_STANDARD.encode(&record.payload),
        })
        .map_err(|e| Error::Internal(format!("encoding log line: {e}")))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| unavailable(&path, e))?;
        file.flush().await.map_err(|e| unavailable(&path, e))?;
        Ok(())
    }

    /// Reads complete lines with offsets `>= from`, stopping after `limit` records. Starts at the
    /// cached position of the partition when `from` lies at or beyond it, otherwise at byte 0.
    async fn read(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<RawRecord>> {
        let path = self.segment_path(topic, partition);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&path, e)),
        };

        let position_key = (topic.to_string(), partition);
        let cached = self.positions.lock().get(&position_key).copied();
        let len = file
            .metadata()
            .await
            .map_err(|e| unavailable(&path, e))?
            .len();
        let mut byte = match cached {
            Some(position) if position.next_offset <= from && position.byte <= len => {
                position.byte
            }
            // no position yet, a rewind, or a segment that was replaced by a shorter one
            _ => 0,
        };
        if byte > 0 {
            file.seek(SeekFrom::Start(byte))
                .await
                .map_err(|e| unavailable(&path, e))?;
        }

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut line = String::new();
        let mut consumed = None;
        while records.len() < limit {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| unavailable(&path, e))?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            let line_start = byte;
            byte += read as u64;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: LogLine = serde_json::from_str(&line).map_err(|e| {
                Error::Decode(format!(
                    "corrupt line at byte {line_start} in {}: {e}",
                    path.display()
                ))
            })?;
            consumed = Some(ReadPosition {
                next_offset: parsed.offset.saturating_add(1),
                byte,
            });
            if parsed.offset < from {
                continue;
            }
            let payload = BASE64_STANDARD.decode(parsed.payload).map_err(|e| {
                Error::Decode(format!(
                    "corrupt payload at offset {} in {}: {e}",
                    parsed.offset,
                    path.display()
                ))
            })?;
            records.push(RawRecord::new(parsed.offset, payload));
        }

        if let Some(position) = consumed {
            self.positions.lock().insert(position_key, position);
        }
        Ok(records)
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::PartitionUnavailable(format!("{}: {e}", path.display()))
}

#[async_trait]
impl PartitionReader for FileLog {
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        from: Offset,
        max_batch: usize,
    ) -> Result<Vec<RawRecord>> {
        let records = self.read(topic, partition, from, max_batch).await?;
        if records.is_empty() {
            tokio::time::sleep(self.poll_timeout).await;
        }
        Ok(records)
    }

    async fn earliest_offset(&self, topic: &str, partition: u32) -> Result<Offset> {
        let first = self.read(topic, partition, Offset::MIN, 1).await?;
        Ok(first.first().map_or(0, |record| record.offset))
    }
}
