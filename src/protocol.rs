//! Message contracts shared by the supervisor and the machines.
//!
//! Everything that crosses the bus is a field-tagged JSON record. Durations
//! travel as integer milliseconds, wall-clock timestamps as RFC 3339.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CnpError;

/// Job identifier, issued monotonically by the supervisor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Assembly,
    Welding,
    Painting,
    Inspection,
    Packaging,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        JobType::Assembly,
        JobType::Welding,
        JobType::Painting,
        JobType::Inspection,
        JobType::Packaging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Assembly => "assembly",
            JobType::Welding => "welding",
            JobType::Painting => "painting",
            JobType::Inspection => "inspection",
            JobType::Packaging => "packaging",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = CnpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assembly" => Ok(JobType::Assembly),
            "welding" => Ok(JobType::Welding),
            "painting" => Ok(JobType::Painting),
            "inspection" => Ok(JobType::Inspection),
            "packaging" => Ok(JobType::Packaging),
            other => Err(CnpError::UnknownJobType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub created_at: DateTime<Utc>,
}

/// Broadcast request inviting bids for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallForProposal {
    pub job_id: JobId,
    pub job_type: JobType,
    pub issued_at: DateTime<Utc>,
}

/// A machine's proposed completion time for a job it can currently service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub job_id: JobId,
    pub machine_id: String,
    #[serde(rename = "proposed_ms", with = "duration_ms")]
    pub proposed: Duration,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Incapable,
    Busy,
    NotSelected,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Incapable => write!(f, "incapable"),
            RejectReason::Busy => write!(f, "busy"),
            RejectReason::NotSelected => write!(f, "not_selected"),
        }
    }
}

/// Explicit "not participating" / "not selected" signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub job_id: JobId,
    pub machine_id: String,
    pub reason: RejectReason,
}

/// Binding assignment of a job to the winning machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub job_id: JobId,
    pub machine_id: String,
    #[serde(rename = "agreed_ms", with = "duration_ms")]
    pub agreed: Duration,
}

/// Payload carried on a per-job bid topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BidReply {
    Bid(Bid),
    Reject(Rejection),
}

impl BidReply {
    pub fn job_id(&self) -> JobId {
        match self {
            BidReply::Bid(bid) => bid.job_id,
            BidReply::Reject(rejection) => rejection.job_id,
        }
    }

    pub fn machine_id(&self) -> &str {
        match self {
            BidReply::Bid(bid) => &bid.machine_id,
            BidReply::Reject(rejection) => &rejection.machine_id,
        }
    }
}

/// Topic layout of the negotiation.
pub mod topic {
    use super::JobId;

    /// Supervisor -> all machines.
    pub const CFP_BROADCAST: &str = "cfp/jobs";

    /// Prefix covering every per-job bid topic.
    pub const BID_PREFIX: &str = "bids/";

    pub fn bids(job_id: JobId) -> String {
        format!("{BID_PREFIX}{job_id}")
    }

    pub fn awards(machine_id: &str) -> String {
        format!("awards/{machine_id}")
    }

    pub fn rejects(machine_id: &str) -> String {
        format!("rejects/{machine_id}")
    }
}

/// Serialize a `Duration` as integer milliseconds on the wire.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
