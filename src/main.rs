use anyhow::Context;
use caravan::{
    config::CaravanConfig,
    inventory::InventoryReader,
    mapping::{BridgeTarget, IdTarget, ResourceMapper, StorageTarget, UnitMapping},
    orchestrator::{MigrationOptions, MigrationRequest, Orchestrator, UnitSpec},
    registry::{JsonTaskStore, MigrationTask, TaskStore},
    remote::SshSessionFactory,
    scheduler::{FleetDispatcher, JobKind, JsonJobStore, JobStore, ScheduledJob, Scheduler, Trigger},
    trust::establish_fleet_trust,
    UnitKind,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "caravan")]
#[command(about = "Fleet migration orchestrator for virtualized hosts")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the fleet configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate compute units between hypervisor hosts
    Migrate(MigrateArgs),
    /// List compute units on a host
    Units {
        /// Host name from the fleet configuration
        host: String,
    },
    /// List storage pools and bridges usable as migration targets
    Resources {
        /// Host name from the fleet configuration
        host: String,
    },
    /// Migration task management
    Task {
        #[command(subcommand)]
        task_command: TaskCommands,
    },
    /// Scheduled job management
    Schedule {
        #[command(subcommand)]
        schedule_command: ScheduleCommands,
    },
    /// Back up a host's configuration tree now
    Backup {
        /// Host name from the fleet configuration
        host: String,
    },
    /// Run a health scan against a host now
    Scan {
        /// Host name from the fleet configuration
        host: String,
    },
    /// Exchange SSH keys between all hypervisor pairs
    Trust,
    /// Run the scheduler daemon
    Daemon,
}

#[derive(Args)]
struct MigrateArgs {
    /// Source host name
    #[arg(long)]
    source: String,

    /// Target host name
    #[arg(long)]
    target: String,

    /// VM ids to migrate (repeatable)
    #[arg(long = "vm")]
    vms: Vec<u32>,

    /// Container ids to migrate (repeatable)
    #[arg(long = "ct")]
    containers: Vec<u32>,

    /// Explicit destination id (single-unit migrations only)
    #[arg(long)]
    target_id: Option<u32>,

    /// Destination storage pool (default: keep the source pool)
    #[arg(long)]
    target_storage: Option<String>,

    /// Interface-to-bridge override, e.g. net0=vmbr1 (repeatable)
    #[arg(long = "bridge-map")]
    bridge_maps: Vec<String>,

    /// Live migration: the unit keeps running until cutover
    #[arg(long)]
    online: bool,

    /// Delete the source-side unit after a successful migration
    #[arg(long)]
    delete_source: bool,

    /// Proceed despite destination identifier conflicts
    #[arg(long)]
    acknowledge_conflicts: bool,

    /// Defer execution: a cron expression or an ISO-8601 timestamp
    #[arg(long)]
    schedule: Option<String>,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List recent migration tasks
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task with its per-step breakdown
    Show { id: String },
    /// Request cancellation at the next step boundary
    Cancel { id: String },
    /// Delete finished tasks from the history
    Prune,
}

#[derive(Clone, Copy, ValueEnum)]
enum JobKindArg {
    ConfigBackup,
    HealthScan,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Schedule a recurring or one-time job
    Add {
        #[arg(value_enum)]
        kind: JobKindArg,
        /// Cron expression or ISO-8601 timestamp
        #[arg(long)]
        trigger: String,
        /// Hosts the job applies to (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// List scheduled jobs
    List,
    Enable { id: String },
    Disable { id: String },
    Remove { id: String },
}

struct Runtime {
    config: Arc<CaravanConfig>,
    tasks: Arc<JsonTaskStore>,
    jobs: Arc<JsonJobStore>,
    sessions: Arc<SshSessionFactory>,
    orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    fn build(config: CaravanConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let tasks = Arc::new(JsonTaskStore::open(&config.state_dir)?);
        let jobs = Arc::new(JsonJobStore::open(&config.state_dir)?);
        let sessions = Arc::new(SshSessionFactory::new(&config.state_dir));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            tasks.clone() as Arc<dyn TaskStore>,
            sessions.clone() as Arc<dyn caravan::remote::SessionFactory>,
        ));
        Ok(Self {
            config,
            tasks,
            jobs,
            sessions,
            orchestrator,
        })
    }

    fn dispatcher(&self) -> FleetDispatcher {
        FleetDispatcher::new(
            Arc::clone(&self.config),
            self.sessions.clone() as Arc<dyn caravan::remote::SessionFactory>,
            Arc::clone(&self.orchestrator),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "caravan=debug"
    } else {
        "caravan=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config_path = cli.config.unwrap_or_else(CaravanConfig::default_path);
    let config = CaravanConfig::load(&config_path)
        .with_context(|| format!("loading fleet configuration from {}", config_path.display()))?;
    let runtime = Runtime::build(config)?;

    match cli.command {
        Commands::Migrate(args) => migrate(&runtime, args).await,
        Commands::Units { host } => list_units(&runtime, &host).await,
        Commands::Resources { host } => list_resources(&runtime, &host).await,
        Commands::Task { task_command } => task_command_run(&runtime, task_command).await,
        Commands::Schedule { schedule_command } => {
            schedule_command_run(&runtime, schedule_command)
        }
        Commands::Backup { host } => {
            let path = runtime.dispatcher().backup_host(&host).await?;
            println!("Backup written to {}", path.display());
            Ok(())
        }
        Commands::Scan { host } => {
            let path = runtime.dispatcher().scan_host(&host).await?;
            println!("Scan report written to {}", path.display());
            Ok(())
        }
        Commands::Trust => trust(&runtime).await,
        Commands::Daemon => daemon(&runtime).await,
    }
}

fn build_request(args: &MigrateArgs) -> anyhow::Result<MigrationRequest> {
    let mut nics = std::collections::BTreeMap::new();
    for entry in &args.bridge_maps {
        let (nic, bridge) = entry
            .split_once('=')
            .with_context(|| format!("bad bridge map '{}', expected net0=vmbr1", entry))?;
        nics.insert(nic.to_string(), BridgeTarget::Explicit(bridge.to_string()));
    }

    let unit_count = args.vms.len() + args.containers.len();
    if args.target_id.is_some() && unit_count != 1 {
        anyhow::bail!("--target-id only applies to single-unit migrations");
    }

    let mapping = UnitMapping {
        id: match args.target_id {
            Some(id) => IdTarget::Explicit(id),
            None => IdTarget::Auto,
        },
        storage: match &args.target_storage {
            Some(pool) => StorageTarget::Explicit(pool.clone()),
            None => StorageTarget::KeepSource,
        },
        nics,
    };

    let mut units = Vec::new();
    for id in &args.vms {
        units.push(UnitSpec {
            id: *id,
            kind: UnitKind::Vm,
            mapping: mapping.clone(),
        });
    }
    for id in &args.containers {
        units.push(UnitSpec {
            id: *id,
            kind: UnitKind::Container,
            mapping: mapping.clone(),
        });
    }

    Ok(MigrationRequest {
        source_host: args.source.clone(),
        target_host: args.target.clone(),
        units,
        options: MigrationOptions {
            online: args.online,
            delete_source: args.delete_source,
            acknowledge_conflicts: args.acknowledge_conflicts,
        },
    })
}

async fn migrate(runtime: &Runtime, args: MigrateArgs) -> anyhow::Result<()> {
    let request = build_request(&args)?;

    if let Some(expr) = &args.schedule {
        let trigger = Trigger::parse(expr)?;
        let job = ScheduledJob::new(
            JobKind::Migration,
            trigger,
            vec![request.source_host.clone(), request.target_host.clone()],
            Some(request),
        );
        println!("Scheduled migration job {} ({})", job.id, job.trigger);
        runtime.jobs.add(job)?;
        println!("Run `caravan daemon` to keep the scheduler ticking.");
        return Ok(());
    }

    let task_id = runtime.orchestrator.submit(request)?;
    println!("Migration task {} started", task_id);

    // Poll the registry like any other observer until the worker is done.
    let mut printed = 0usize;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let task = runtime.tasks.get(&task_id)?;
        if task.log.len() > printed {
            print!("{}", &task.log[printed..]);
            printed = task.log.len();
        }
        if task.status.is_terminal() {
            print_task(&task);
            if task.status != caravan::TaskStatus::Completed {
                anyhow::bail!("migration finished with status {:?}", task.status);
            }
            return Ok(());
        }
    }
}

async fn list_units(runtime: &Runtime, host_name: &str) -> anyhow::Result<()> {
    let host = runtime.config.host(host_name)?;
    let session = caravan::remote::SessionFactory::connect(runtime.sessions.as_ref(), host).await?;
    let reader = InventoryReader::new();
    let result = reader.list_units(host, session.as_ref()).await;
    let _ = session.disconnect().await;
    let units = result?;

    println!(
        "{:<8} {:<10} {:<24} {:<10} {:<20} NICS",
        "ID", "KIND", "NAME", "STATE", "STORAGES"
    );
    for unit in units {
        println!(
            "{:<8} {:<10} {:<24} {:<10} {:<20} {}",
            unit.id,
            format!("{:?}", unit.kind).to_lowercase(),
            unit.name,
            format!("{:?}", unit.state).to_lowercase(),
            unit.storages.join(","),
            unit.nics.join(",")
        );
    }
    Ok(())
}

async fn list_resources(runtime: &Runtime, host_name: &str) -> anyhow::Result<()> {
    let host = runtime.config.host(host_name)?;
    let session = caravan::remote::SessionFactory::connect(runtime.sessions.as_ref(), host).await?;
    let mapper = ResourceMapper::new();
    let result = mapper.target_resources(host, session.as_ref()).await;
    let _ = session.disconnect().await;
    let resources = result?;

    println!("Storage pools on {}:", host_name);
    for pool in &resources.storages {
        println!("  {}", pool);
    }
    println!("Bridges on {}:", host_name);
    for bridge in &resources.bridges {
        println!("  {}", bridge);
    }
    Ok(())
}

async fn task_command_run(runtime: &Runtime, command: TaskCommands) -> anyhow::Result<()> {
    match command {
        TaskCommands::List { limit } => {
            let tasks = runtime.tasks.list(limit)?;
            println!(
                "{:<38} {:<10} {:<12} {:<12} {:<10} CREATED",
                "ID", "STATUS", "SOURCE", "TARGET", "PROGRESS"
            );
            for task in tasks {
                println!(
                    "{:<38} {:<10} {:<12} {:<12} {:<10} {}",
                    task.id,
                    format!("{:?}", task.status).to_lowercase(),
                    task.source_host,
                    task.target_host,
                    format!("{}/{}", task.progress, task.total_steps),
                    task.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        TaskCommands::Show { id } => {
            let task = runtime.tasks.get(&id)?;
            print_task(&task);
            if !task.log.is_empty() {
                println!("\nLog:\n{}", task.log);
            }
        }
        TaskCommands::Cancel { id } => {
            runtime.orchestrator.cancel(&id)?;
            println!("Cancellation requested for {}", id);
        }
        TaskCommands::Prune => {
            let removed = runtime.tasks.delete_history()?;
            println!("Removed {} finished task(s)", removed);
        }
    }
    Ok(())
}

fn schedule_command_run(runtime: &Runtime, command: ScheduleCommands) -> anyhow::Result<()> {
    match command {
        ScheduleCommands::Add {
            kind,
            trigger,
            hosts,
        } => {
            if hosts.is_empty() {
                anyhow::bail!("at least one --host is required");
            }
            for host in &hosts {
                runtime.config.host(host)?;
            }
            let kind = match kind {
                JobKindArg::ConfigBackup => JobKind::ConfigBackup,
                JobKindArg::HealthScan => JobKind::HealthScan,
            };
            let job = ScheduledJob::new(kind, Trigger::parse(&trigger)?, hosts, None);
            println!("Scheduled job {} ({})", job.id, job.trigger);
            runtime.jobs.add(job)?;
        }
        ScheduleCommands::List => {
            let jobs = runtime.jobs.list()?;
            println!(
                "{:<38} {:<14} {:<9} {:<26} LAST FIRED",
                "ID", "KIND", "ENABLED", "TRIGGER"
            );
            for job in jobs {
                println!(
                    "{:<38} {:<14} {:<9} {:<26} {}",
                    job.id,
                    format!("{:?}", job.kind).to_lowercase(),
                    job.enabled,
                    job.trigger.to_string(),
                    job.last_fired_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        ScheduleCommands::Enable { id } => {
            runtime.jobs.set_enabled(&id, true)?;
            println!("Job {} enabled", id);
        }
        ScheduleCommands::Disable { id } => {
            runtime.jobs.set_enabled(&id, false)?;
            println!("Job {} disabled (an in-flight fire is not cancelled)", id);
        }
        ScheduleCommands::Remove { id } => {
            runtime.jobs.remove(&id)?;
            println!("Job {} removed", id);
        }
    }
    Ok(())
}

async fn trust(runtime: &Runtime) -> anyhow::Result<()> {
    let hosts: Vec<_> = runtime.config.hypervisors().cloned().collect();
    if hosts.len() < 2 {
        anyhow::bail!("trust setup needs at least two hypervisor hosts");
    }
    println!(
        "Exchanging keys across {} host pair(s), serially...",
        hosts.len() * (hosts.len() - 1)
    );
    let report = establish_fleet_trust(runtime.sessions.as_ref(), &hosts).await?;
    println!("Established {} pair(s)", report.pairs_established);
    for (source, target, reason) in &report.failures {
        println!("  failed {} -> {}: {}", source, target, reason);
    }
    if report.failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} pair(s) failed", report.failures.len())
    }
}

async fn daemon(runtime: &Runtime) -> anyhow::Result<()> {
    let dispatcher = Arc::new(runtime.dispatcher());
    let scheduler = Scheduler::new(
        runtime.jobs.clone() as Arc<dyn JobStore>,
        dispatcher,
        runtime.config.scheduler.tick_seconds,
    );
    scheduler.run().await;
    Ok(())
}

fn print_task(task: &MigrationTask) {
    println!(
        "\nTask {}  {} -> {}  status: {:?}  progress: {}/{}",
        task.id,
        task.source_host,
        task.target_host,
        task.status,
        task.progress,
        task.total_steps
    );
    println!("{:<24} {:<10} NOTE", "STEP", "STATUS");
    for step in &task.steps {
        let note = step.log.lines().last().unwrap_or("");
        println!(
            "{:<24} {:<10} {}",
            step.name,
            format!("{:?}", step.status).to_lowercase(),
            note
        );
    }
}
