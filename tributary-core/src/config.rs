//! Tuning knobs of a stream run. Every field has a default suitable for a long running consumer;
//! [StreamConfig::validate] rejects combinations the engine cannot honour.

use std::time::Duration;

use crate::message::Offset;
use crate::retry::Exponential;
use crate::{Error, Result};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_BATCH: usize = 500;
const DEFAULT_MAX_DECODE_FAILURES: u32 = 100;
const DEFAULT_MAX_FLUSH_FAILURES: u32 = 6;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Where to begin reading when no offset was ever committed for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// First offset still retained by the partition.
    #[default]
    Earliest,
    /// An explicit offset.
    At(Offset),
}

/// What to do with a record that keeps failing `process` after `max_process_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Stop the stream with a process error.
    #[default]
    Fail,
    /// Log the record and move past it. The skipped offset never becomes the high-water offset
    /// by itself.
    Skip,
}

/// Exponential backoff settings for one retried concern.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub base_interval: Duration,
    pub max_interval: Duration,
    /// Number of retries after the first attempt, `None` retries forever.
    pub max_retries: Option<u16>,
}

impl RetryConfig {
    pub fn new(base_interval: Duration, max_interval: Duration, max_retries: Option<u16>) -> Self {
        Self {
            base_interval,
            max_interval,
            max_retries,
        }
    }

    /// A fresh backoff iterator for one retried operation.
    pub(crate) fn backoff(&self) -> Exponential {
        Exponential::new(
            self.base_interval,
            self.max_interval,
            DEFAULT_RETRY_FACTOR,
            DEFAULT_RETRY_JITTER,
            self.max_retries,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// How often the processor is flushed and the high-water offset committed.
    pub flush_interval: Duration,
    /// Upper bound of records requested per fetch.
    pub max_batch: usize,
    pub start_offset: StartOffset,
    /// Consecutive decode failures tolerated before the stream fails.
    pub max_decode_failures: u32,
    /// Consecutive failed flush cycles tolerated before the stream fails.
    pub max_flush_failures: u32,
    /// Attempts per record before [PoisonPolicy] applies, `None` holds the record back forever.
    pub max_process_attempts: Option<u32>,
    pub poison_policy: PoisonPolicy,
    /// Backoff between re-deliveries of a record that failed `process`.
    pub process_retry: RetryConfig,
    /// Backoff for `get`/`commit` on an unavailable offset store.
    pub store_retry: RetryConfig,
    /// Backoff for fetches on an unavailable partition.
    pub fetch_retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch: DEFAULT_MAX_BATCH,
            start_offset: StartOffset::Earliest,
            max_decode_failures: DEFAULT_MAX_DECODE_FAILURES,
            max_flush_failures: DEFAULT_MAX_FLUSH_FAILURES,
            max_process_attempts: None,
            poison_policy: PoisonPolicy::Fail,
            process_retry: RetryConfig::new(Duration::from_secs(1), Duration::from_secs(30), None),
            store_retry: RetryConfig::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
                Some(5),
            ),
            fetch_retry: RetryConfig::new(
                Duration::from_millis(100),
                Duration::from_secs(10),
                None,
            ),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval.is_zero() {
            return Err(Error::Config(
                "flush interval must be greater than zero".to_string(),
            ));
        }
        if self.max_batch == 0 {
            return Err(Error::Config(
                "max batch size must be greater than zero".to_string(),
            ));
        }
        if let StartOffset::At(offset) = self.start_offset
            && offset < 0
        {
            return Err(Error::Config(format!(
                "start offset {offset} must not be negative"
            )));
        }
        if self.max_process_attempts == Some(0) {
            return Err(Error::Config(
                "max process attempts must be greater than zero when set".to_string(),
            ));
        }
        for (name, retry) in [
            ("process", &self.process_retry),
            ("store", &self.store_retry),
            ("fetch", &self.fetch_retry),
        ] {
            if retry.base_interval > retry.max_interval {
                return Err(Error::Config(format!(
                    "{name} retry base interval {:?} exceeds its max interval {:?}",
                    retry.base_interval, retry.max_interval
                )));
            }
        }
        Ok(())
    }
}
