//! Supervisor (coordinator) agent for the contract net.
//!
//! Drives one auction per job: broadcast a call for proposal, collect bids
//! until a fixed deadline, award the minimum-time bid (ties broken by
//! machine id) or report the job unassigned. Each auction record sits
//! behind its own lock so records for different jobs never contend and the
//! close-for-writes / read-for-evaluation transition is atomic.

pub mod agent;
pub mod auction;

pub use agent::{JobOutcome, JobRecord, Supervisor, SupervisorReport};
pub use auction::{Auction, ClosedAuction, RecordOutcome};
