use std::sync::Arc;

use parking_lot::Mutex;

use crate::message::Offset;

/// Offsets of one stream run. Written by the consumption loop (high-water, stuck) and the flush
/// routine (committed). Always `committed <= high_water`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Progress {
    high_water: Option<Offset>,
    committed: Option<Offset>,
    stuck: Option<Stuck>,
}

/// A record that failed `process` and is being held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stuck {
    pub(crate) offset: Offset,
    pub(crate) attempts: u32,
}

pub(crate) type SharedProgress = Arc<Mutex<Progress>>;

impl Progress {
    /// Starts a run from the committed offset, the high-water offset begins there too.
    pub(crate) fn resumed(committed: Option<Offset>) -> Self {
        Self {
            high_water: committed,
            committed,
            stuck: None,
        }
    }

    pub(crate) fn high_water(&self) -> Option<Offset> {
        self.high_water
    }

    pub(crate) fn committed(&self) -> Option<Offset> {
        self.committed
    }

    pub(crate) fn stuck(&self) -> Option<Stuck> {
        self.stuck
    }

    /// Marks `offset` as processed. Returns whether a held back record got through.
    pub(crate) fn advance(&mut self, offset: Offset) -> bool {
        debug_assert!(
            self.high_water.is_none_or(|hw| offset > hw),
            "high-water offset must strictly increase"
        );
        self.high_water = Some(offset);
        self.stuck.take().is_some()
    }

    /// Counts a failed attempt for `offset` and returns the attempts made so far.
    pub(crate) fn fail(&mut self, offset: Offset) -> u32 {
        let attempts = match self.stuck {
            Some(stuck) if stuck.offset == offset => stuck.attempts.saturating_add(1),
            _ => 1,
        };
        self.stuck = Some(Stuck { offset, attempts });
        attempts
    }

    /// Gives up on the held back record without advancing the high-water offset.
    pub(crate) fn skip(&mut self) {
        self.stuck = None;
    }

    pub(crate) fn commit(&mut self, offset: Offset) {
        debug_assert!(
            self.high_water.is_some_and(|hw| offset <= hw),
            "committed offset cannot pass the high-water offset"
        );
        self.committed = Some(offset);
    }
}
