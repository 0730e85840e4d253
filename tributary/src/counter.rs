use async_trait::async_trait;
use tracing::info;
use tributary_core::{BoxError, Offset, Processor};

/// Message carried by the counter topics.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct Counter {
    #[prost(int64, tag = "1")]
    pub(crate) count: i64,
}

/// Adds up the `count` of every message and reports the running total on flush.
#[derive(Debug, Default)]
pub(crate) struct CounterProcessor {
    total: i64,
    processed: u64,
    last_offset: Option<Offset>,
}

impl CounterProcessor {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Processor<Counter> for CounterProcessor {
    async fn process(&mut self, offset: Offset, message: Counter) -> Result<(), BoxError> {
        self.total = self
            .total
            .checked_add(message.count)
            .ok_or_else(|| format!("total overflows at offset {offset}"))?;
        self.processed += 1;
        self.last_offset = Some(offset);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BoxError> {
        info!(
            total = self.total,
            processed = self.processed,
            last_offset = ?self.last_offset,
            "Counter total"
        );
        Ok(())
    }
}
