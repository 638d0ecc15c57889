use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use cnp_lite::config::{MachineConfig, SimulationConfig, SupervisorConfig};
use cnp_lite::shutdown::install_shutdown_handler;
use cnp_lite::simulation::{Simulation, SimulationReport};
use cnp_lite::supervisor::JobOutcome;

#[derive(Parser, Debug)]
#[command(name = "cnp-lite")]
#[command(version)]
#[command(about = "A contract net job allocation engine over topic-based pub/sub")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a supervisor and a machine fleet on one in-process bus
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of jobs to dispatch
    #[arg(long, default_value = "10")]
    jobs: usize,

    /// Bid collection deadline per auction, in milliseconds
    #[arg(long, default_value = "3000")]
    deadline_ms: u64,

    /// Pause between job dispatches, in milliseconds
    #[arg(long, default_value = "2000")]
    interval_ms: u64,

    /// Machine spec "name=job:duration[,job:duration...]", repeatable.
    /// Example: --machine "machine_a=assembly:4,inspection:2"
    /// Defaults to the stock heterogeneous fleet when omitted.
    #[arg(long = "machine")]
    machines: Vec<String>,

    /// Seed for job type generation (deterministic runs)
    #[arg(long)]
    seed: Option<u64>,

    /// Fractional noise on proposed completion times, e.g. 0.1 for +/-10%
    #[arg(long, default_value = "0.0")]
    bid_jitter: f64,

    /// How long to wait for busy machines after the last auction, in
    /// milliseconds
    #[arg(long, default_value = "10000")]
    drain_timeout_ms: u64,

    /// Output format for the final report
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(ValueEnum, Clone, Debug)]
enum OutputFormat {
    Table,
    Json,
}

async fn run_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let machines = if args.machines.is_empty() {
        SimulationConfig::default_fleet()
    } else {
        args.machines
            .iter()
            .map(|spec| MachineConfig::parse_spec(spec))
            .collect::<Result<Vec<_>, _>>()?
    };
    let machines: Vec<MachineConfig> = machines
        .into_iter()
        .map(|m| m.with_jitter(args.bid_jitter))
        .collect();

    let config = SimulationConfig {
        supervisor: SupervisorConfig {
            bid_deadline: Duration::from_millis(args.deadline_ms),
            dispatch_interval: Duration::from_millis(args.interval_ms),
            job_count: args.jobs,
            seed: args.seed,
        },
        machines,
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
    };

    tracing::info!(
        jobs = config.supervisor.job_count,
        deadline_ms = args.deadline_ms,
        interval_ms = args.interval_ms,
        machines = config.machines.len(),
        "Starting contract net simulation"
    );

    let cancel = install_shutdown_handler();
    let report = Simulation::new(config).run(cancel).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_report(&report),
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!("Contract Net Simulation Report");
    println!("{}", "=".repeat(60));
    println!("Jobs dispatched: {}", report.supervisor.jobs.len());
    println!("Assigned:        {}", report.supervisor.assigned);
    println!("Unassigned:      {}", report.supervisor.unassigned);
    println!("Late drops:      {}", report.supervisor.late_messages);
    println!("Stray drops:     {}", report.supervisor.stray_messages);
    println!("Malformed drops: {}", report.supervisor.malformed_messages);
    println!();

    println!("Jobs:");
    println!("{:<6} {:<12} OUTCOME", "ID", "TYPE");
    println!("{}", "-".repeat(60));
    for record in &report.supervisor.jobs {
        let outcome = match &record.outcome {
            JobOutcome::Awarded { machine_id, agreed } => {
                format!(
                    "awarded to {} ({}ms, {} bids)",
                    machine_id,
                    agreed.as_millis(),
                    record.bids_received
                )
            }
            JobOutcome::Unassigned => "unassigned".to_string(),
        };
        println!("{:<6} {:<12} {}", record.job.id, record.job.job_type, outcome);
    }
    println!();

    println!("Machines:");
    println!(
        "{:<14} {:<6} {:<6} {:<6} {:<9} ANOMALIES",
        "ID", "BIDS", "WON", "DONE", "DECLINED"
    );
    println!("{}", "-".repeat(60));
    for machine in &report.machines {
        println!(
            "{:<14} {:<6} {:<6} {:<6} {:<9} {}",
            machine.machine_id,
            machine.bids_submitted,
            machine.bids_won,
            machine.jobs_completed,
            machine.rejections_sent,
            machine.anomalies
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(simulate_args) => run_simulate(simulate_args).await?,
    }
    Ok(())
}
