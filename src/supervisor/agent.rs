use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Envelope, TopicFilter};
use crate::config::SupervisorConfig;
use crate::error::CnpError;
use crate::protocol::{
    duration_ms, topic, Award, BidReply, CallForProposal, Job, JobId, JobType, RejectReason,
    Rejection,
};
use crate::supervisor::auction::{Auction, RecordOutcome};

/// Final state of one job's negotiation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Awarded {
        machine_id: String,
        #[serde(rename = "agreed_ms", with = "duration_ms")]
        agreed: Duration,
    },
    Unassigned,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job: Job,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub bids_received: usize,
}

/// What the supervisor observed across its run.
#[derive(Debug, Default, Serialize)]
pub struct SupervisorReport {
    pub jobs: Vec<JobRecord>,
    pub assigned: u64,
    pub unassigned: u64,
    pub rejections_received: u64,
    pub late_messages: u64,
    pub stray_messages: u64,
    pub malformed_messages: u64,
}

/// Coordinator agent: drives one auction per job with a bounded
/// bid-collection window, then awards the best bid or reports the job
/// unassigned.
pub struct Supervisor {
    config: SupervisorConfig,
    bus: Bus,
    bid_rx: mpsc::UnboundedReceiver<Envelope>,
    auctions: HashMap<JobId, Arc<Mutex<Auction>>>,
    next_job_id: u64,
    rng: StdRng,
    report: SupervisorReport,
}

impl Supervisor {
    /// Subscribe to the bid topic prefix and build an idle supervisor.
    pub async fn new(config: SupervisorConfig, bus: Bus) -> Self {
        let bid_rx = bus
            .subscribe(vec![TopicFilter::prefix(topic::BID_PREFIX)])
            .await;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            bus,
            bid_rx,
            auctions: HashMap::new(),
            next_job_id: 1,
            rng,
            report: SupervisorReport::default(),
        }
    }

    pub fn report(&self) -> &SupervisorReport {
        &self.report
    }

    pub fn into_report(self) -> SupervisorReport {
        self.report
    }

    /// Allocate the next job id, broadcast its CfP and open the auction
    /// window. Returns immediately; bids are gathered by `collect_bids`.
    pub async fn dispatch_job(&mut self, job_type: JobType) -> crate::Result<Job> {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;

        let job = Job {
            id,
            job_type,
            created_at: Utc::now(),
        };
        let cfp = CallForProposal {
            job_id: id,
            job_type,
            issued_at: job.created_at,
        };
        self.bus
            .publish(topic::CFP_BROADCAST, serde_json::to_string(&cfp)?)
            .await;

        let deadline = Instant::now() + self.config.bid_deadline;
        self.auctions
            .insert(id, Arc::new(Mutex::new(Auction::new(id, deadline))));

        tracing::info!(
            job_id = %id,
            job_type = %job_type,
            deadline_ms = self.config.bid_deadline.as_millis() as u64,
            "Dispatched call for proposal"
        );
        Ok(job)
    }

    /// Record inbound bids and refusals for `job` until its deadline.
    /// Arrivals at or after the deadline are dropped, never queued.
    pub async fn collect_bids(&mut self, job: &Job) {
        let Some(auction) = self.auctions.get(&job.id) else {
            return;
        };
        let deadline = { auction.lock().await.deadline() };

        let window = tokio::time::sleep_until(deadline);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut window => break,
                envelope = self.bid_rx.recv() => {
                    match envelope {
                        Some(envelope) => self.record_message(envelope).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// Close the job's auction, pick the winner among the recorded bids and
    /// announce the outcome: an award to the winner, a not-selected
    /// rejection to every other bidder. Machines that never responded are
    /// not notified. The auction record is discarded.
    pub async fn evaluate(&mut self, job: &Job) -> crate::Result<JobOutcome> {
        let auction = self
            .auctions
            .remove(&job.id)
            .ok_or_else(|| CnpError::Internal(format!("no auction open for job {}", job.id)))?;
        let closed = { auction.lock().await.close() };
        self.report.late_messages += closed.late;

        let outcome = match closed.select_winner() {
            Some(winner) => {
                let winner_id = winner.machine_id.clone();
                let agreed = winner.proposed;

                let award = Award {
                    job_id: job.id,
                    machine_id: winner_id.clone(),
                    agreed,
                };
                self.bus
                    .publish(&topic::awards(&winner_id), serde_json::to_string(&award)?)
                    .await;

                for bid in closed.bids.values().filter(|b| b.machine_id != winner_id) {
                    let rejection = Rejection {
                        job_id: job.id,
                        machine_id: bid.machine_id.clone(),
                        reason: RejectReason::NotSelected,
                    };
                    self.bus
                        .publish(
                            &topic::rejects(&bid.machine_id),
                            serde_json::to_string(&rejection)?,
                        )
                        .await;
                }

                tracing::info!(
                    job_id = %job.id,
                    machine_id = %winner_id,
                    agreed_ms = agreed.as_millis() as u64,
                    bidders = closed.bids.len(),
                    "Job awarded"
                );
                self.report.assigned += 1;
                JobOutcome::Awarded {
                    machine_id: winner_id,
                    agreed,
                }
            }
            None => {
                tracing::info!(job_id = %job.id, "No bids before deadline, job unassigned");
                self.report.unassigned += 1;
                JobOutcome::Unassigned
            }
        };

        self.report.jobs.push(JobRecord {
            job: job.clone(),
            outcome: outcome.clone(),
            bids_received: closed.bids.len(),
        });
        Ok(outcome)
    }

    /// Run the configured number of auction rounds sequentially:
    /// dispatch -> collect until deadline -> evaluate, spaced by the
    /// dispatch interval.
    pub async fn run(mut self, cancel: CancellationToken) -> crate::Result<SupervisorReport> {
        for round in 0..self.config.job_count {
            if cancel.is_cancelled() {
                tracing::info!("Shutdown requested, stopping dispatch");
                break;
            }

            let job_type = JobType::ALL[self.rng.gen_range(0..JobType::ALL.len())];
            let job = self.dispatch_job(job_type).await?;
            self.collect_bids(&job).await;
            self.evaluate(&job).await?;

            if round + 1 < self.config.job_count {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.dispatch_interval) => {}
                }
            }
        }

        tracing::info!(
            assigned = self.report.assigned,
            unassigned = self.report.unassigned,
            late = self.report.late_messages,
            "Supervisor finished"
        );
        Ok(self.report)
    }

    async fn record_message(&mut self, envelope: Envelope) {
        let reply: BidReply = match serde_json::from_str(&envelope.payload) {
            Ok(reply) => reply,
            Err(error) => {
                self.report.malformed_messages += 1;
                tracing::warn!(topic = %envelope.topic, %error, "Dropping malformed message");
                return;
            }
        };

        let job_id = reply.job_id();
        let Some(auction) = self.auctions.get(&job_id).cloned() else {
            self.report.stray_messages += 1;
            tracing::debug!(
                job_id = %job_id,
                machine_id = %reply.machine_id(),
                "Dropping message for unknown or closed auction"
            );
            return;
        };

        let now = Instant::now();
        let mut auction = auction.lock().await;
        match reply {
            BidReply::Bid(bid) => {
                let machine_id = bid.machine_id.clone();
                let proposed_ms = bid.proposed.as_millis() as u64;
                match auction.record_bid(bid, now) {
                    RecordOutcome::Recorded => {
                        tracing::info!(
                            job_id = %job_id,
                            machine_id = %machine_id,
                            proposed_ms,
                            "Bid recorded"
                        );
                    }
                    RecordOutcome::Replaced => {
                        tracing::debug!(
                            job_id = %job_id,
                            machine_id = %machine_id,
                            proposed_ms,
                            "Bid replaced this machine's earlier bid"
                        );
                    }
                    RecordOutcome::Late | RecordOutcome::Closed => {
                        tracing::debug!(
                            job_id = %job_id,
                            machine_id = %machine_id,
                            "Dropping late bid"
                        );
                    }
                }
            }
            BidReply::Reject(rejection) => {
                self.report.rejections_received += 1;
                let _ = auction.note_rejection(now);
                tracing::debug!(
                    job_id = %job_id,
                    machine_id = %rejection.machine_id,
                    reason = %rejection.reason,
                    "Machine declined"
                );
            }
        }
    }
}
