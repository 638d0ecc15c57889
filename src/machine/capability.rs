use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CnpError;
use crate::protocol::JobType;

/// A machine's fixed mapping from job type to estimated completion time.
///
/// Validated at construction: every estimate must be a positive duration.
/// A job type absent from the table means the machine is incapable of it.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<JobType, Duration>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job_type: JobType, estimate: Duration) -> crate::Result<Self> {
        if estimate.is_zero() {
            return Err(CnpError::InvalidCapability(format!(
                "estimate for {job_type} must be positive"
            )));
        }
        self.entries.insert(job_type, estimate);
        Ok(self)
    }

    /// Estimated completion time for a job type, or `None` if incapable.
    pub fn estimate(&self, job_type: JobType) -> Option<Duration> {
        self.entries.get(&job_type).copied()
    }

    pub fn can_perform(&self, job_type: JobType) -> bool {
        self.entries.contains_key(&job_type)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Supported job types, sorted for stable logging.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.entries.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

impl FromStr for CapabilityTable {
    type Err = CnpError;

    /// Parse `assembly:5,welding:10` (seconds, fractional allowed) or the
    /// `painting:250ms` millisecond form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut table = CapabilityTable::new();
        for entry in s.split(',') {
            let entry = entry.trim();
            let (name, value) = entry.split_once(':').ok_or_else(|| {
                CnpError::InvalidCapability(format!("expected job:duration, got '{entry}'"))
            })?;
            let job_type: JobType = name.trim().parse()?;
            table = table.with(job_type, parse_estimate(value.trim())?)?;
        }
        if table.is_empty() {
            return Err(CnpError::InvalidCapability(
                "capability table is empty".to_string(),
            ));
        }
        Ok(table)
    }
}

fn parse_estimate(value: &str) -> crate::Result<Duration> {
    if let Some(ms) = value.strip_suffix("ms") {
        let ms: u64 = ms
            .trim()
            .parse()
            .map_err(|_| CnpError::InvalidCapability(format!("invalid duration '{value}'")))?;
        if ms == 0 {
            return Err(CnpError::InvalidCapability(format!(
                "duration '{value}' must be positive"
            )));
        }
        return Ok(Duration::from_millis(ms));
    }

    let secs: f64 = value
        .parse()
        .map_err(|_| CnpError::InvalidCapability(format!("invalid duration '{value}'")))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(CnpError::InvalidCapability(format!(
            "duration '{value}' must be positive"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}
