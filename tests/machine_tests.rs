use std::time::Duration;

use chrono::Utc;
use cnp_lite::config::MachineConfig;
use cnp_lite::machine::{AwardDecision, CfpDecision, Machine};
use cnp_lite::protocol::{Award, CallForProposal, JobId, JobType, RejectReason, Rejection};
use tokio::time::Instant;

fn machine(capabilities: &str) -> Machine {
    let config = MachineConfig::parse_spec(&format!("m1={capabilities}")).unwrap();
    Machine::new(&config)
}

fn cfp(job_id: u64, job_type: JobType) -> CallForProposal {
    CallForProposal {
        job_id: JobId(job_id),
        job_type,
        issued_at: Utc::now(),
    }
}

fn award(job_id: u64, agreed_secs: u64) -> Award {
    Award {
        job_id: JobId(job_id),
        machine_id: "m1".to_string(),
        agreed: Duration::from_secs(agreed_secs),
    }
}

/// Drive the machine into the busy state via a normal bid/award round.
fn make_busy(machine: &mut Machine, job_id: u64) {
    let decision = machine.handle_cfp(&cfp(job_id, JobType::Assembly), Utc::now());
    assert!(matches!(decision, CfpDecision::Bid(_)));
    let decision = machine.handle_award(&award(job_id, 5), Instant::now());
    assert!(matches!(decision, AwardDecision::Accepted { .. }));
}

#[test]
fn idle_capable_machine_bids_its_table_estimate() {
    let mut machine = machine("assembly:4,inspection:2");
    match machine.handle_cfp(&cfp(1, JobType::Inspection), Utc::now()) {
        CfpDecision::Bid(bid) => {
            assert_eq!(bid.job_id, JobId(1));
            assert_eq!(bid.machine_id, "m1");
            assert_eq!(bid.proposed, Duration::from_secs(2));
        }
        other => panic!("expected bid, got {other:?}"),
    }
    assert!(!machine.is_busy());
}

#[test]
fn incapable_machine_rejects_with_incapable() {
    let mut machine = machine("assembly:4");
    match machine.handle_cfp(&cfp(1, JobType::Welding), Utc::now()) {
        CfpDecision::Reject(rejection) => {
            assert_eq!(rejection.reason, RejectReason::Incapable);
            assert_eq!(rejection.job_id, JobId(1));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn busy_machine_never_bids_even_when_capable() {
    let mut machine = machine("assembly:4");
    make_busy(&mut machine, 1);

    match machine.handle_cfp(&cfp(2, JobType::Assembly), Utc::now()) {
        CfpDecision::Reject(rejection) => assert_eq!(rejection.reason, RejectReason::Busy),
        other => panic!("expected busy rejection, got {other:?}"),
    }
}

#[test]
fn award_transitions_to_busy_until_agreed_time() {
    let mut machine = machine("assembly:4");
    machine.handle_cfp(&cfp(1, JobType::Assembly), Utc::now());

    let now = Instant::now();
    match machine.handle_award(&award(1, 7), now) {
        AwardDecision::Accepted { until } => {
            assert_eq!(until, now + Duration::from_secs(7));
        }
        other => panic!("expected accept, got {other:?}"),
    }
    assert!(machine.is_busy());
    assert_eq!(machine.current_job(), Some(JobId(1)));
    assert_eq!(
        machine.completion_deadline(),
        Some(now + Duration::from_secs(7))
    );
}

#[test]
fn duplicate_award_is_a_noop() {
    let mut machine = machine("assembly:4");
    make_busy(&mut machine, 1);
    let deadline = machine.completion_deadline();

    let decision = machine.handle_award(&award(1, 5), Instant::now());
    assert_eq!(decision, AwardDecision::Duplicate);
    assert_eq!(machine.current_job(), Some(JobId(1)));
    assert_eq!(machine.completion_deadline(), deadline);
}

#[test]
fn award_for_another_job_while_busy_is_refused() {
    let mut machine = machine("assembly:4");
    machine.handle_cfp(&cfp(1, JobType::Assembly), Utc::now());
    machine.handle_cfp(&cfp(2, JobType::Assembly), Utc::now());
    let decision = machine.handle_award(&award(1, 5), Instant::now());
    assert!(matches!(decision, AwardDecision::Accepted { .. }));

    // The second award must not overwrite the running job.
    let decision = machine.handle_award(&award(2, 1), Instant::now());
    assert_eq!(
        decision,
        AwardDecision::RefusedBusy {
            current: JobId(1)
        }
    );
    assert_eq!(machine.current_job(), Some(JobId(1)));
}

#[test]
fn award_without_outstanding_bid_is_refused() {
    let mut machine = machine("assembly:4");
    let decision = machine.handle_award(&award(9, 5), Instant::now());
    assert_eq!(decision, AwardDecision::UnknownJob);
    assert!(!machine.is_busy());
}

#[test]
fn completion_returns_machine_to_idle_and_bid_eligible() {
    let mut machine = machine("assembly:4");
    make_busy(&mut machine, 1);

    assert_eq!(machine.complete(), Some(JobId(1)));
    assert!(!machine.is_busy());
    assert!(machine.completion_deadline().is_none());

    match machine.handle_cfp(&cfp(2, JobType::Assembly), Utc::now()) {
        CfpDecision::Bid(bid) => assert_eq!(bid.job_id, JobId(2)),
        other => panic!("expected bid after completion, got {other:?}"),
    }
}

#[test]
fn award_redelivered_after_completion_is_refused() {
    let mut machine = machine("assembly:4");
    make_busy(&mut machine, 1);
    machine.complete();

    let decision = machine.handle_award(&award(1, 5), Instant::now());
    assert_eq!(decision, AwardDecision::UnknownJob);
    assert!(!machine.is_busy());
}

#[test]
fn not_selected_notice_clears_the_outstanding_bid() {
    let mut machine = machine("assembly:4");
    machine.handle_cfp(&cfp(1, JobType::Assembly), Utc::now());
    machine.handle_rejection(&Rejection {
        job_id: JobId(1),
        machine_id: "m1".to_string(),
        reason: RejectReason::NotSelected,
    });

    // The bid is resolved, so a straggling award for it is an anomaly.
    let decision = machine.handle_award(&award(1, 5), Instant::now());
    assert_eq!(decision, AwardDecision::UnknownJob);
}

#[test]
fn bid_jitter_stays_within_the_configured_fraction() {
    let config = MachineConfig::parse_spec("m1=assembly:4")
        .unwrap()
        .with_jitter(0.5);
    let mut machine = Machine::new(&config);

    for round in 0..20 {
        match machine.handle_cfp(&cfp(round, JobType::Assembly), Utc::now()) {
            CfpDecision::Bid(bid) => {
                assert!(bid.proposed >= Duration::from_secs(2));
                assert!(bid.proposed <= Duration::from_secs(6));
            }
            other => panic!("expected bid, got {other:?}"),
        }
    }
}
