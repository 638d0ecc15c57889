use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::protocol::{Bid, JobId};

/// Result of recording an inbound message into an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// A later bid from the same machine replaced the earlier one.
    Replaced,
    /// Arrived at or after the deadline; dropped.
    Late,
    /// The auction was already closed for evaluation; dropped.
    Closed,
}

/// Per-job negotiation window. Bids are keyed by machine id so a duplicate
/// bid overwrites rather than accumulates. The record is expected to sit
/// behind a lock: `record_bid` and `close` on the same instance must be
/// mutually exclusive so that closing for writes and reading for evaluation
/// happen atomically relative to inbound handlers.
#[derive(Debug)]
pub struct Auction {
    job_id: JobId,
    deadline: Instant,
    open: bool,
    bids: BTreeMap<String, Bid>,
    late: u64,
}

impl Auction {
    pub fn new(job_id: JobId, deadline: Instant) -> Self {
        Self {
            job_id,
            deadline,
            open: true,
            bids: BTreeMap::new(),
            late: 0,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    /// Record a bid received at `at`. Arrivals at or after the deadline
    /// never reach the bid set, even if evaluation has not run yet.
    pub fn record_bid(&mut self, bid: Bid, at: Instant) -> RecordOutcome {
        if !self.open {
            self.late += 1;
            return RecordOutcome::Closed;
        }
        if at >= self.deadline {
            self.late += 1;
            return RecordOutcome::Late;
        }
        match self.bids.insert(bid.machine_id.clone(), bid) {
            Some(_) => RecordOutcome::Replaced,
            None => RecordOutcome::Recorded,
        }
    }

    /// Note a machine's refusal. Refusals never enter the bid set; the
    /// window check only feeds the late counter.
    pub fn note_rejection(&mut self, at: Instant) -> RecordOutcome {
        if !self.open {
            self.late += 1;
            return RecordOutcome::Closed;
        }
        if at >= self.deadline {
            self.late += 1;
            return RecordOutcome::Late;
        }
        RecordOutcome::Recorded
    }

    /// Close the window for writes and take the recorded bid set. After
    /// this, every further `record_bid` returns [`RecordOutcome::Closed`].
    pub fn close(&mut self) -> ClosedAuction {
        self.open = false;
        ClosedAuction {
            bids: std::mem::take(&mut self.bids),
            late: self.late,
        }
    }
}

/// The immutable outcome of a closed auction window.
#[derive(Debug)]
pub struct ClosedAuction {
    pub bids: BTreeMap<String, Bid>,
    pub late: u64,
}

impl ClosedAuction {
    /// The bid with the minimum proposed completion time; exact ties go to
    /// the lexicographically smallest machine id, so the winner is unique.
    pub fn select_winner(&self) -> Option<&Bid> {
        self.bids.values().min_by(|a, b| {
            a.proposed
                .cmp(&b.proposed)
                .then_with(|| a.machine_id.cmp(&b.machine_id))
        })
    }
}
