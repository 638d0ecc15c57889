use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::config::MachineConfig;
use crate::machine::capability::CapabilityTable;
use crate::protocol::{Award, Bid, CallForProposal, JobId, RejectReason, Rejection};

/// The machine's single execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: JobId,
    pub until: Instant,
}

/// Response to an incoming call for proposal.
///
/// A busy or incapable machine answers with an explicit rejection rather
/// than staying silent; the supervisor's evaluation only ever reads the
/// recorded bid set, so either policy is compatible with it.
#[derive(Debug, Clone)]
pub enum CfpDecision {
    Bid(Bid),
    Reject(Rejection),
}

/// Outcome of processing an award.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwardDecision {
    /// Transitioned to busy; work finishes at `until`.
    Accepted { until: Instant },
    /// Redelivery of the award for the job already being executed.
    Duplicate,
    /// Award for another job while busy. The current assignment is kept.
    RefusedBusy { current: JobId },
    /// Award with no matching outstanding bid.
    UnknownJob,
}

/// Pure state machine for a worker agent: capability matching, a busy/idle
/// slot, and the set of bids still awaiting a verdict. All I/O lives in the
/// agent loop wrapping this type.
#[derive(Debug)]
pub struct Machine {
    id: String,
    capabilities: CapabilityTable,
    bid_jitter: f64,
    rng: StdRng,
    current: Option<Assignment>,
    pending_bids: HashMap<JobId, Duration>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            id: config.id.clone(),
            capabilities: config.capabilities.clone(),
            bid_jitter: config.bid_jitter,
            rng: StdRng::from_entropy(),
            current: None,
            pending_bids: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_job(&self) -> Option<JobId> {
        self.current.map(|a| a.job_id)
    }

    /// Instant at which the current job finishes, if busy.
    pub fn completion_deadline(&self) -> Option<Instant> {
        self.current.map(|a| a.until)
    }

    /// Decide whether to bid on a call for proposal. A busy machine never
    /// bids, regardless of capability.
    pub fn handle_cfp(&mut self, cfp: &CallForProposal, now: DateTime<Utc>) -> CfpDecision {
        if self.is_busy() {
            return CfpDecision::Reject(self.rejection(cfp.job_id, RejectReason::Busy));
        }

        let Some(estimate) = self.capabilities.estimate(cfp.job_type) else {
            return CfpDecision::Reject(self.rejection(cfp.job_id, RejectReason::Incapable));
        };

        let proposed = self.proposed_time(estimate);
        self.pending_bids.insert(cfp.job_id, proposed);
        CfpDecision::Bid(Bid {
            job_id: cfp.job_id,
            machine_id: self.id.clone(),
            proposed,
            submitted_at: now,
        })
    }

    /// Process an award addressed to this machine. An award that would
    /// overwrite the current assignment, or that matches no outstanding bid,
    /// is refused without any state change.
    pub fn handle_award(&mut self, award: &Award, now: Instant) -> AwardDecision {
        if let Some(current) = self.current {
            if current.job_id == award.job_id {
                return AwardDecision::Duplicate;
            }
            return AwardDecision::RefusedBusy {
                current: current.job_id,
            };
        }

        if self.pending_bids.remove(&award.job_id).is_none() {
            return AwardDecision::UnknownJob;
        }

        let until = now + award.agreed;
        self.current = Some(Assignment {
            job_id: award.job_id,
            until,
        });
        AwardDecision::Accepted { until }
    }

    /// A not-selected notice resolves the outstanding bid for that job.
    pub fn handle_rejection(&mut self, rejection: &Rejection) {
        self.pending_bids.remove(&rejection.job_id);
    }

    /// Finish the current job and return to idle.
    pub fn complete(&mut self) -> Option<JobId> {
        self.current.take().map(|a| a.job_id)
    }

    fn rejection(&self, job_id: JobId, reason: RejectReason) -> Rejection {
        Rejection {
            job_id,
            machine_id: self.id.clone(),
            reason,
        }
    }

    fn proposed_time(&mut self, estimate: Duration) -> Duration {
        if self.bid_jitter <= 0.0 {
            return estimate;
        }
        let noise = self.rng.gen_range(-self.bid_jitter..=self.bid_jitter);
        let scaled = estimate.mul_f64((1.0 + noise).max(0.01));
        scaled.max(Duration::from_millis(1))
    }
}
