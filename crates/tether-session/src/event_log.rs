//! Bounded, append-only log of pushed events.
//!
//! Every message pushed to a client is recorded here first, with a
//! per-session id starting at 1, so that a client reconnecting with
//! `Last-Event-ID` can be sent exactly what it missed. Records are evicted
//! oldest first by count and age; the highest evicted id is kept as the
//! replay floor.

use std::collections::VecDeque;
use std::sync::Arc;

use tether_protocol::EventId;
use tokio::time::Instant;

use crate::config::EventLogConfig;

/// One pushed event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Event id, unique and increasing within the session.
    pub id: EventId,
    /// Serialized single-line JSON envelope.
    pub payload: Arc<str>,
    /// When the event was appended.
    pub emitted_at: Instant,
}

/// The client asked to resume from a point the log cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGap {
    /// Last event id the client saw.
    pub requested: EventId,
    /// Highest evicted event id.
    pub floor: EventId,
    /// Newest event id issued.
    pub newest: EventId,
}

/// Bounded event log for one session.
#[derive(Debug)]
pub struct EventLog {
    config: EventLogConfig,
    records: VecDeque<EventRecord>,
    next_id: EventId,
    floor: EventId,
}

impl EventLog {
    /// Create an empty log.
    pub fn new(config: EventLogConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(config.capacity.min(64)),
            config,
            next_id: 1,
            floor: 0,
        }
    }

    /// Append a payload and return its event id.
    pub fn append(&mut self, payload: impl Into<Arc<str>>) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(EventRecord {
            id,
            payload: payload.into(),
            emitted_at: Instant::now(),
        });
        self.prune();
        id
    }

    /// The most recently appended record, if still retained.
    pub fn latest(&self) -> Option<&EventRecord> {
        self.records.back()
    }

    /// Records after `last`, in ascending order.
    ///
    /// Fails if any record after `last` has been evicted, or if `last` is
    /// newer than anything this log ever issued. `replay_from(newest)` is
    /// an empty replay.
    pub fn replay_from(&self, last: EventId) -> Result<Vec<EventRecord>, ReplayGap> {
        let newest = self.newest();
        if last < self.floor || last > newest {
            return Err(ReplayGap {
                requested: last,
                floor: self.floor,
                newest,
            });
        }
        Ok(self.records_after(last))
    }

    /// Retained records after `last`, skipping any that were evicted.
    pub fn records_after(&self, last: EventId) -> Vec<EventRecord> {
        let start = self.records.partition_point(|record| record.id <= last);
        self.records.range(start..).cloned().collect()
    }

    /// Evict records beyond the capacity or older than the maximum age.
    ///
    /// Returns the number of evicted records.
    pub fn prune(&mut self) -> usize {
        let mut evicted = 0;

        while self.records.len() > self.config.capacity {
            self.evict_front();
            evicted += 1;
        }

        if let Some(max_age) = self.config.max_age {
            while self
                .records
                .front()
                .is_some_and(|record| record.emitted_at.elapsed() > max_age)
            {
                self.evict_front();
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::trace!(evicted, floor = self.floor, "event log pruned");
        }
        evicted
    }

    fn evict_front(&mut self) {
        if let Some(record) = self.records.pop_front() {
            self.floor = record.id;
        }
    }

    /// Drop every record. Resuming is impossible afterwards.
    pub fn clear(&mut self) {
        self.records.clear();
        self.floor = self.newest();
    }

    /// Id of the oldest retained record.
    pub fn oldest(&self) -> Option<EventId> {
        self.records.front().map(|record| record.id)
    }

    /// Id of the newest record ever issued, or 0 if none.
    pub fn newest(&self) -> EventId {
        self.next_id - 1
    }

    /// Highest evicted id, or 0 if nothing was evicted.
    pub fn floor(&self) -> EventId {
        self.floor
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check whether no records are retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
