//! Identity and payload types that flow from the partition reader into the engine.
//!
//! A [RawRecord] is owned by the engine from the moment it is fetched until it is decoded and
//! handed to the processor; nothing in the engine retains it afterwards. The [StreamKey] is the
//! only identity that outlives a run, since it addresses the committed offset in the
//! [crate::offset_store::OffsetStore].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::{Error, Result};

/// Position of a record within a partition. Assigned by the upstream log; the engine relies only
/// on its ordering.
pub type Offset = i64;

/// StreamKey identifies one consumption lineage, `(topic, partition, client-id)`.
///
/// NOTE: the client-id must be unique per topic and partition across every consumer sharing the
/// same offset store, otherwise commits from the two consumers race each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    topic: Arc<str>,
    partition: u32,
    client_id: Arc<str>,
}

impl StreamKey {
    pub fn new(
        topic: impl Into<String>,
        partition: u32,
        client_id: impl Into<String>,
    ) -> crate::Result<Self> {
        let topic = topic.into();
        let client_id = client_id.into();
        if topic.trim().is_empty() {
            return Err(Error::Config("topic name cannot be empty".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(Error::Config("client id cannot be empty".to_string()));
        }
        Ok(Self {
            topic: topic.into(),
            partition,
            client_id: client_id.into(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Label pairs used for every per-stream metric.
    pub(crate) fn metric_labels(&self) -> Vec<(String, String)> {
        vec![
            ("topic".to_string(), self.topic.to_string()),
            ("partition".to_string(), self.partition.to_string()),
            ("client_id".to_string(), self.client_id.to_string()),
        ]
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.topic, self.partition, self.client_id)
    }
}

/// A record as returned by the partition reader, before decoding.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: Offset,
    pub payload: Bytes,
}

impl RawRecord {
    pub fn new(offset: Offset, payload: impl Into<Bytes>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }
}

/// Offset following `offset`.
pub(crate) fn successor(offset: Offset) -> Result<Offset> {
    offset
        .checked_add(1)
        .ok_or_else(|| Error::Internal(format!("offset {offset} has no successor")))
}
