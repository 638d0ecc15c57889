//! End-to-end negotiation rounds over the in-process bus, with shortened
//! timings for fast tests.

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use cnp_lite::bus::{Bus, Envelope, TopicFilter};
use cnp_lite::config::{MachineConfig, SimulationConfig, SupervisorConfig};
use cnp_lite::machine::{MachineAgent, MachineHandle};
use cnp_lite::protocol::{topic, Award, Bid, BidReply, JobId, JobType, RejectReason, Rejection};
use cnp_lite::simulation::Simulation;
use cnp_lite::supervisor::{JobOutcome, Supervisor};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn test_config(deadline_ms: u64) -> SupervisorConfig {
    SupervisorConfig {
        bid_deadline: Duration::from_millis(deadline_ms),
        dispatch_interval: Duration::from_millis(10),
        job_count: 1,
        seed: Some(7),
    }
}

async fn spawn_fleet(
    bus: &Bus,
    cancel: &CancellationToken,
    specs: &[&str],
) -> Vec<MachineHandle> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        let config = MachineConfig::parse_spec(spec).unwrap();
        handles.push(MachineAgent::spawn(config, bus.clone(), cancel.clone()).await);
    }
    handles
}

async fn recv_award(rx: &mut UnboundedReceiver<Envelope>) -> (String, Award) {
    let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for award")
        .expect("award channel closed");
    let award: Award = serde_json::from_str(&envelope.payload).unwrap();
    (envelope.topic, award)
}

fn drain_awards(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Award> {
    let mut awards = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        awards.push(serde_json::from_str(&envelope.payload).unwrap());
    }
    awards
}

// Scenario A: three capable machines bid {5, 3, 7}; the 3s bidder wins and
// the other two receive not-selected rejections.
#[tokio::test]
async fn lowest_bid_wins_and_losers_are_rejected() {
    let bus = Bus::new();
    let cancel = CancellationToken::new();
    let _fleet = spawn_fleet(
        &bus,
        &cancel,
        &["m_a=assembly:5", "m_b=assembly:3", "m_c=assembly:7"],
    )
    .await;

    let mut awards_rx = bus.subscribe(vec![TopicFilter::prefix("awards/")]).await;
    let mut rejects_rx = bus.subscribe(vec![TopicFilter::prefix("rejects/")]).await;

    let mut supervisor = Supervisor::new(test_config(300), bus.clone()).await;
    let job = supervisor.dispatch_job(JobType::Assembly).await.unwrap();
    supervisor.collect_bids(&job).await;
    let outcome = supervisor.evaluate(&job).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome::Awarded {
            machine_id: "m_b".to_string(),
            agreed: Duration::from_secs(3),
        }
    );

    let (award_topic, award) = recv_award(&mut awards_rx).await;
    assert_eq!(award_topic, "awards/m_b");
    assert_eq!(award.job_id, job.id);
    assert_eq!(award.machine_id, "m_b");

    let mut rejected = Vec::new();
    for _ in 0..2 {
        let envelope = tokio::time::timeout(Duration::from_secs(1), rejects_rx.recv())
            .await
            .expect("timed out waiting for rejection")
            .expect("reject channel closed");
        let rejection: Rejection = serde_json::from_str(&envelope.payload).unwrap();
        assert_eq!(rejection.job_id, job.id);
        assert_eq!(rejection.reason, RejectReason::NotSelected);
        rejected.push(rejection.machine_id);
    }
    rejected.sort();
    assert_eq!(rejected, vec!["m_a".to_string(), "m_c".to_string()]);

    let report = supervisor.report();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.jobs[0].bids_received, 3);

    cancel.cancel();
}

// Scenario B: once every machine is busy, a further CfP gathers zero bids
// and the job resolves unassigned with no award ever published.
#[tokio::test]
async fn all_busy_fleet_yields_unassigned_job() {
    let bus = Bus::new();
    let cancel = CancellationToken::new();
    let fleet = spawn_fleet(&bus, &cancel, &["m_a=assembly:30", "m_b=assembly:30"]).await;

    let mut awards_rx = bus.subscribe(vec![TopicFilter::prefix("awards/")]).await;

    let mut config = test_config(200);
    config.job_count = 3;
    let mut supervisor = Supervisor::new(config, bus.clone()).await;

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let job = supervisor.dispatch_job(JobType::Assembly).await.unwrap();
        supervisor.collect_bids(&job).await;
        outcomes.push(supervisor.evaluate(&job).await.unwrap());
        // Let the award land so the winner is busy before the next CfP.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Ties go to the lexicographically smaller id, so m_a wins job 1 and
    // m_b wins job 2; by job 3 the whole fleet is busy.
    assert_eq!(
        outcomes[0],
        JobOutcome::Awarded {
            machine_id: "m_a".to_string(),
            agreed: Duration::from_secs(30),
        }
    );
    assert_eq!(
        outcomes[1],
        JobOutcome::Awarded {
            machine_id: "m_b".to_string(),
            agreed: Duration::from_secs(30),
        }
    );
    assert_eq!(outcomes[2], JobOutcome::Unassigned);

    let report = supervisor.report();
    assert_eq!(report.assigned, 2);
    assert_eq!(report.unassigned, 1);
    // m_a declined job 2; both machines declined job 3.
    assert_eq!(report.rejections_received, 3);

    let awards = drain_awards(&mut awards_rx);
    assert_eq!(awards.len(), 2);
    assert!(awards.iter().all(|a| a.job_id != JobId(3)));

    let m_a = &fleet[0];
    let m_b = &fleet[1];
    assert_eq!(m_a.stats.bids_submitted.load(Ordering::SeqCst), 1);
    assert_eq!(m_b.stats.bids_submitted.load(Ordering::SeqCst), 2);

    cancel.cancel();
}

// Scenario C: a machine that bids and then crashes before the deadline is
// still counted by evaluation and may win the award.
#[tokio::test]
async fn crashed_bidder_can_still_win() {
    let bus = Bus::new();
    let cancel = CancellationToken::new();
    let fleet = spawn_fleet(&bus, &cancel, &["m_only=welding:2"]).await;

    let mut awards_rx = bus.subscribe(vec![TopicFilter::prefix("awards/")]).await;

    let mut supervisor = Supervisor::new(test_config(400), bus.clone()).await;
    let job = supervisor.dispatch_job(JobType::Welding).await.unwrap();

    // The bid is published almost immediately; give it time to land, then
    // kill the machine before the deadline.
    tokio::time::sleep(Duration::from_millis(100)).await;
    fleet[0].task.abort();

    supervisor.collect_bids(&job).await;
    let outcome = supervisor.evaluate(&job).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome::Awarded {
            machine_id: "m_only".to_string(),
            agreed: Duration::from_secs(2),
        }
    );

    // The award goes out even though the winner will never execute it.
    let (award_topic, award) = recv_award(&mut awards_rx).await;
    assert_eq!(award_topic, "awards/m_only");
    assert_eq!(award.job_id, job.id);

    cancel.cancel();
}

#[tokio::test]
async fn duplicate_bid_resolves_to_last_write() {
    let bus = Bus::new();
    let mut supervisor = Supervisor::new(test_config(250), bus.clone()).await;
    let job = supervisor.dispatch_job(JobType::Painting).await.unwrap();

    for proposed_secs in [5, 2] {
        let reply = BidReply::Bid(Bid {
            job_id: job.id,
            machine_id: "m_x".to_string(),
            proposed: Duration::from_secs(proposed_secs),
            submitted_at: Utc::now(),
        });
        bus.publish(&topic::bids(job.id), serde_json::to_string(&reply).unwrap())
            .await;
    }

    supervisor.collect_bids(&job).await;
    let outcome = supervisor.evaluate(&job).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome::Awarded {
            machine_id: "m_x".to_string(),
            agreed: Duration::from_secs(2),
        }
    );
    assert_eq!(supervisor.report().jobs[0].bids_received, 1);
}

#[tokio::test]
async fn malformed_and_stray_messages_are_dropped() {
    let bus = Bus::new();
    let mut supervisor = Supervisor::new(test_config(200), bus.clone()).await;
    let job = supervisor.dispatch_job(JobType::Assembly).await.unwrap();

    bus.publish(&topic::bids(job.id), "{not valid json".to_string())
        .await;

    // A well-formed bid for a job with no open auction is a stray.
    let stray = BidReply::Bid(Bid {
        job_id: JobId(99),
        machine_id: "m_x".to_string(),
        proposed: Duration::from_secs(1),
        submitted_at: Utc::now(),
    });
    bus.publish(
        &topic::bids(JobId(99)),
        serde_json::to_string(&stray).unwrap(),
    )
    .await;

    supervisor.collect_bids(&job).await;
    let outcome = supervisor.evaluate(&job).await.unwrap();

    assert_eq!(outcome, JobOutcome::Unassigned);
    let report = supervisor.report();
    assert_eq!(report.malformed_messages, 1);
    assert_eq!(report.stray_messages, 1);
    assert_eq!(report.unassigned, 1);
}

#[tokio::test]
async fn duplicate_award_delivery_is_a_noop_at_the_machine() {
    let bus = Bus::new();
    let cancel = CancellationToken::new();
    let fleet = spawn_fleet(&bus, &cancel, &["m_a=assembly:2"]).await;

    let mut awards_rx = bus.subscribe(vec![TopicFilter::prefix("awards/")]).await;

    let mut supervisor = Supervisor::new(test_config(200), bus.clone()).await;
    let job = supervisor.dispatch_job(JobType::Assembly).await.unwrap();
    supervisor.collect_bids(&job).await;
    supervisor.evaluate(&job).await.unwrap();

    let (_, award) = recv_award(&mut awards_rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fleet[0].stats.busy.load(Ordering::SeqCst));

    // Redeliver the same award; the machine must detect the duplicate.
    bus.publish(
        &topic::awards("m_a"),
        serde_json::to_string(&award).unwrap(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fleet[0].stats.bids_won.load(Ordering::SeqCst), 1);
    assert_eq!(fleet[0].stats.anomalies.load(Ordering::SeqCst), 0);
    assert!(fleet[0].stats.busy.load(Ordering::SeqCst));

    cancel.cancel();
}

#[tokio::test]
async fn full_simulation_assigns_every_job_to_a_capable_idle_fleet() {
    let all_types = "assembly:50ms,welding:50ms,painting:50ms,inspection:50ms,packaging:50ms";
    let config = SimulationConfig {
        supervisor: SupervisorConfig {
            bid_deadline: Duration::from_millis(150),
            dispatch_interval: Duration::from_millis(120),
            job_count: 3,
            seed: Some(42),
        },
        machines: vec![
            MachineConfig::parse_spec(&format!("m_all={all_types}")).unwrap(),
            MachineConfig::parse_spec("m_slow=assembly:80ms").unwrap(),
        ],
        drain_timeout: Duration::from_secs(2),
    };

    let report = Simulation::new(config)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.supervisor.jobs.len(), 3);
    assert_eq!(report.supervisor.assigned, 3);
    assert_eq!(report.supervisor.unassigned, 0);

    let won: u64 = report.machines.iter().map(|m| m.bids_won).sum();
    let completed: u64 = report.machines.iter().map(|m| m.jobs_completed).sum();
    assert_eq!(won, 3);
    assert_eq!(completed, 3);
}
