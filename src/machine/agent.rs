use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, Envelope, TopicFilter};
use crate::config::MachineConfig;
use crate::machine::state::{AwardDecision, CfpDecision, Machine};
use crate::protocol::{topic, Award, BidReply, CallForProposal, Rejection};

/// Counters shared between a running machine task and its observers.
#[derive(Debug, Default)]
pub struct MachineStats {
    pub bids_submitted: AtomicU64,
    pub bids_won: AtomicU64,
    pub jobs_completed: AtomicU64,
    pub rejections_sent: AtomicU64,
    pub anomalies: AtomicU64,
    pub busy: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineReport {
    pub machine_id: String,
    pub bids_submitted: u64,
    pub bids_won: u64,
    pub jobs_completed: u64,
    pub rejections_sent: u64,
    pub anomalies: u64,
}

impl MachineStats {
    pub fn report(&self, machine_id: &str) -> MachineReport {
        MachineReport {
            machine_id: machine_id.to_string(),
            bids_submitted: self.bids_submitted.load(Ordering::SeqCst),
            bids_won: self.bids_won.load(Ordering::SeqCst),
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            rejections_sent: self.rejections_sent.load(Ordering::SeqCst),
            anomalies: self.anomalies.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a spawned machine agent task.
pub struct MachineHandle {
    pub machine_id: String,
    pub stats: Arc<MachineStats>,
    pub task: JoinHandle<()>,
}

/// Worker agent task: owns a [`Machine`] state machine and reacts to bus
/// traffic. The state is never touched from outside this task.
pub struct MachineAgent {
    machine: Machine,
    bus: Bus,
    rx: tokio::sync::mpsc::UnboundedReceiver<Envelope>,
    stats: Arc<MachineStats>,
    cancel: CancellationToken,
    award_topic: String,
    reject_topic: String,
}

impl MachineAgent {
    /// Subscribe to this machine's topics and spawn its agent loop. The
    /// subscription is registered before this returns, so a CfP published
    /// afterwards is guaranteed to reach the agent.
    pub async fn spawn(
        config: MachineConfig,
        bus: Bus,
        cancel: CancellationToken,
    ) -> MachineHandle {
        let award_topic = topic::awards(&config.id);
        let reject_topic = topic::rejects(&config.id);
        let rx = bus
            .subscribe(vec![
                TopicFilter::exact(topic::CFP_BROADCAST),
                TopicFilter::exact(award_topic.clone()),
                TopicFilter::exact(reject_topic.clone()),
            ])
            .await;

        let machine = Machine::new(&config);
        tracing::info!(
            machine_id = %config.id,
            capabilities = ?config.capabilities.job_types(),
            "Machine ready to receive CfPs"
        );

        let stats = Arc::new(MachineStats::default());
        let agent = Self {
            machine,
            bus,
            rx,
            stats: stats.clone(),
            cancel,
            award_topic,
            reject_topic,
        };

        MachineHandle {
            machine_id: config.id,
            stats,
            task: tokio::spawn(agent.run()),
        }
    }

    async fn run(mut self) {
        loop {
            let completion = self.machine.completion_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(machine_id = %self.machine.id(), "Machine stopping");
                    break;
                }
                _ = sleep_until_or_never(completion) => {
                    self.on_completion();
                }
                envelope = self.rx.recv() => {
                    match envelope {
                        Some(envelope) => self.on_message(envelope).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn on_message(&mut self, envelope: Envelope) {
        if envelope.topic == topic::CFP_BROADCAST {
            self.on_cfp(&envelope).await;
        } else if envelope.topic == self.award_topic {
            self.on_award(&envelope);
        } else if envelope.topic == self.reject_topic {
            self.on_rejection(&envelope);
        } else {
            tracing::debug!(
                machine_id = %self.machine.id(),
                topic = %envelope.topic,
                "Ignoring message on unexpected topic"
            );
        }
    }

    async fn on_cfp(&mut self, envelope: &Envelope) {
        let Some(cfp) = decode::<CallForProposal>(self.machine.id(), envelope) else {
            return;
        };

        let reply = match self.machine.handle_cfp(&cfp, Utc::now()) {
            CfpDecision::Bid(bid) => {
                self.stats.bids_submitted.fetch_add(1, Ordering::SeqCst);
                tracing::info!(
                    machine_id = %self.machine.id(),
                    job_id = %bid.job_id,
                    proposed_ms = bid.proposed.as_millis() as u64,
                    "Submitting bid"
                );
                BidReply::Bid(bid)
            }
            CfpDecision::Reject(rejection) => {
                self.stats.rejections_sent.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    machine_id = %self.machine.id(),
                    job_id = %rejection.job_id,
                    reason = %rejection.reason,
                    "Declining call for proposal"
                );
                BidReply::Reject(rejection)
            }
        };

        self.publish(&topic::bids(cfp.job_id), &reply).await;
    }

    fn on_award(&mut self, envelope: &Envelope) {
        let Some(award) = decode::<Award>(self.machine.id(), envelope) else {
            return;
        };
        if award.machine_id != self.machine.id() {
            self.stats.anomalies.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                machine_id = %self.machine.id(),
                award_machine_id = %award.machine_id,
                job_id = %award.job_id,
                "Dropping award addressed to a different machine"
            );
            return;
        }

        match self.machine.handle_award(&award, Instant::now()) {
            AwardDecision::Accepted { .. } => {
                self.stats.bids_won.fetch_add(1, Ordering::SeqCst);
                self.stats.busy.store(true, Ordering::SeqCst);
                tracing::info!(
                    machine_id = %self.machine.id(),
                    job_id = %award.job_id,
                    agreed_ms = award.agreed.as_millis() as u64,
                    "Won job, starting work"
                );
            }
            AwardDecision::Duplicate => {
                tracing::debug!(
                    machine_id = %self.machine.id(),
                    job_id = %award.job_id,
                    "Ignoring duplicate award"
                );
            }
            AwardDecision::RefusedBusy { current } => {
                self.stats.anomalies.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    machine_id = %self.machine.id(),
                    job_id = %award.job_id,
                    current_job = %current,
                    "Refusing award received while busy"
                );
            }
            AwardDecision::UnknownJob => {
                self.stats.anomalies.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    machine_id = %self.machine.id(),
                    job_id = %award.job_id,
                    "Refusing award with no outstanding bid"
                );
            }
        }
    }

    fn on_rejection(&mut self, envelope: &Envelope) {
        let Some(rejection) = decode::<Rejection>(self.machine.id(), envelope) else {
            return;
        };
        self.machine.handle_rejection(&rejection);
        tracing::debug!(
            machine_id = %self.machine.id(),
            job_id = %rejection.job_id,
            reason = %rejection.reason,
            "Bid not selected"
        );
    }

    fn on_completion(&mut self) {
        if let Some(job_id) = self.machine.complete() {
            self.stats.jobs_completed.fetch_add(1, Ordering::SeqCst);
            self.stats.busy.store(false, Ordering::SeqCst);
            tracing::info!(
                machine_id = %self.machine.id(),
                job_id = %job_id,
                "Completed job, machine idle"
            );
        }
    }

    async fn publish<T: Serialize>(&self, topic: &str, message: &T) {
        match serde_json::to_string(message) {
            Ok(payload) => self.bus.publish(topic, payload).await,
            Err(error) => tracing::error!(
                machine_id = %self.machine.id(),
                topic,
                %error,
                "Failed to encode outbound message"
            ),
        }
    }
}

/// Sleep until the completion deadline, or forever while idle.
async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn decode<T: serde::de::DeserializeOwned>(machine_id: &str, envelope: &Envelope) -> Option<T> {
    match serde_json::from_str(&envelope.payload) {
        Ok(message) => Some(message),
        Err(error) => {
            tracing::warn!(
                machine_id,
                topic = %envelope.topic,
                %error,
                "Dropping malformed message"
            );
            None
        }
    }
}
