use std::time::Duration;

use crate::error::CnpError;
use crate::machine::capability::CapabilityTable;

/// Configuration for the supervisor's auction loop.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long each auction accepts bids after the CfP is dispatched.
    pub bid_deadline: Duration,
    /// Pause between consecutive job dispatches.
    pub dispatch_interval: Duration,
    /// Number of jobs to dispatch before the supervisor finishes.
    pub job_count: usize,
    /// Seed for job type generation. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bid_deadline: Duration::from_secs(3),
            dispatch_interval: Duration::from_secs(2),
            job_count: 10,
            seed: None,
        }
    }
}

/// Configuration for a single machine agent.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub id: String,
    pub capabilities: CapabilityTable,
    /// Fractional noise applied to proposed completion times, e.g. 0.1 for
    /// +/-10%. Zero keeps bids exactly at the capability estimate.
    pub bid_jitter: f64,
}

impl MachineConfig {
    pub fn new(id: impl Into<String>, capabilities: CapabilityTable) -> Self {
        Self {
            id: id.into(),
            capabilities,
            bid_jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, bid_jitter: f64) -> Self {
        self.bid_jitter = bid_jitter;
        self
    }

    /// Parse a CLI fleet entry of the form
    /// `machine_a=assembly:4,inspection:2`.
    pub fn parse_spec(spec: &str) -> crate::Result<Self> {
        let (id, capabilities) = spec.split_once('=').ok_or_else(|| {
            CnpError::InvalidMachineSpec(format!(
                "expected name=job:duration[,job:duration...], got '{spec}'"
            ))
        })?;
        let id = id.trim();
        if id.is_empty() {
            return Err(CnpError::InvalidMachineSpec(format!(
                "machine name is empty in '{spec}'"
            )));
        }
        Ok(Self {
            id: id.to_string(),
            capabilities: capabilities.parse()?,
            bid_jitter: 0.0,
        })
    }
}

/// Top-level configuration for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub supervisor: SupervisorConfig,
    pub machines: Vec<MachineConfig>,
    /// Upper bound on waiting for busy machines to finish after the
    /// supervisor's last auction.
    pub drain_timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            machines: Self::default_fleet(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl SimulationConfig {
    /// The stock heterogeneous fleet used when no machines are configured.
    pub fn default_fleet() -> Vec<MachineConfig> {
        [
            "machine_a=assembly:4,inspection:2",
            "machine_b=assembly:6,welding:8,inspection:3",
            "machine_c=welding:5,painting:4",
            "machine_d=painting:3,packaging:2,inspection:4",
        ]
        .iter()
        // SAFETY: these are hardcoded specs that always parse
        .map(|spec| MachineConfig::parse_spec(spec).expect("default fleet spec is valid"))
        .collect()
    }
}
