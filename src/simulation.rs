use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::SimulationConfig;
use crate::machine::{MachineAgent, MachineHandle, MachineReport};
use crate::supervisor::{Supervisor, SupervisorReport};

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub supervisor: SupervisorReport,
    pub machines: Vec<MachineReport>,
}

/// Wires one supervisor and a machine fleet onto a shared bus and runs the
/// negotiation to completion.
pub struct Simulation {
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Run the simulation:
    /// 1. Spawn every machine agent (subscriptions land before any CfP)
    /// 2. Run the supervisor's auction rounds to completion
    /// 3. Wait for busy machines to finish, bounded by the drain timeout
    /// 4. Stop the machine tasks and aggregate the report
    pub async fn run(self, cancel: CancellationToken) -> crate::Result<SimulationReport> {
        let bus = Bus::new();
        let machine_cancel = cancel.child_token();

        let mut handles = Vec::with_capacity(self.config.machines.len());
        for machine_config in &self.config.machines {
            handles.push(
                MachineAgent::spawn(machine_config.clone(), bus.clone(), machine_cancel.clone())
                    .await,
            );
        }

        let supervisor = Supervisor::new(self.config.supervisor.clone(), bus.clone()).await;
        let supervisor_report = supervisor.run(cancel.clone()).await?;

        self.drain(&handles, &cancel).await;
        machine_cancel.cancel();

        let mut machines = Vec::with_capacity(handles.len());
        for handle in handles {
            let MachineHandle {
                machine_id,
                stats,
                task,
            } = handle;
            if let Err(error) = task.await {
                tracing::warn!(machine_id = %machine_id, %error, "Machine task ended abnormally");
            }
            machines.push(stats.report(&machine_id));
        }

        Ok(SimulationReport {
            supervisor: supervisor_report,
            machines,
        })
    }

    /// Let awarded work finish before stopping the fleet. Gives up at the
    /// drain timeout or on external cancellation.
    async fn drain(&self, handles: &[MachineHandle], cancel: &CancellationToken) {
        let deadline = Instant::now() + self.config.drain_timeout;
        while handles
            .iter()
            .any(|handle| handle.stats.busy.load(Ordering::SeqCst))
        {
            if cancel.is_cancelled() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Drain timeout reached with machines still busy");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
