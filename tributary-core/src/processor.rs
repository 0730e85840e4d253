use async_trait::async_trait;

use crate::BoxError;
use crate::message::Offset;

/// Processor is the user supplied sink of a stream.
///
/// `process` is called once per decoded record, in strictly increasing offset order. A failed
/// record is delivered again later, so `process` has to tolerate seeing the same offset twice.
/// `flush` must make the effects of every record processed so far durable; only after it returns
/// `Ok` is the offset of the last processed record committed.
///
/// `process` and `flush` are never called concurrently.
#[async_trait]
pub trait Processor<M>: Send + 'static {
    async fn process(&mut self, offset: Offset, message: M) -> Result<(), BoxError>;

    async fn flush(&mut self) -> Result<(), BoxError>;
}
