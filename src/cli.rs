//! CLI surface for packmaint.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::Config;
use crate::maintenance::gateway::GitProcessGateway;
use crate::maintenance::lock::read_lock_holder;
use crate::maintenance::loose_step::LooseObjectsStep;
use crate::maintenance::pack_step::PackCompactionStep;
use crate::maintenance::scheduler::{Scheduler, run_scheduler_loop};
use crate::maintenance::{MaintenanceStep, StepOutcome, inspector};
use crate::{Error, Result, paths};

#[derive(Parser, Debug)]
#[command(
    name = "pm",
    version,
    about = "Object-store maintenance for virtualized git enlistments",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one maintenance step now and exit.
    Run(RunArgs),

    /// Print a snapshot of the pack directory and lock state.
    Status(StatusArgs),

    /// Run the background scheduler until the process is terminated.
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Object store root (the objects directory of the shared cache).
    #[arg(long, value_name = "PATH")]
    pub objects_root: Option<PathBuf>,

    /// Which step to run.
    #[arg(long, value_enum, default_value_t = StepKind::Pack)]
    pub step: StepKind,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long, value_name = "PATH")]
    pub objects_root: Option<PathBuf>,

    /// Machine-readable JSON output.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(long, value_name = "PATH")]
    pub objects_root: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Pack,
    Loose,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run_step(args, &config),
        Commands::Status(args) => status(args, &config),
        Commands::Watch(args) => watch(args, &config),
    }
}

fn resolve_objects_root(arg: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    arg.or_else(|| config.maintenance.objects_root.clone())
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no object store root: pass --objects-root or set maintenance.objects_root",
            ))
        })
}

fn run_step(args: RunArgs, config: &Config) -> Result<()> {
    let objects_root = resolve_objects_root(args.objects_root, config)?;
    let gateway = Arc::new(GitProcessGateway::new(config.maintenance.command_timeout()));

    let step: Box<dyn MaintenanceStep> = match args.step {
        StepKind::Pack => Box::new(PackCompactionStep::new(objects_root, gateway)),
        StepKind::Loose => Box::new(LooseObjectsStep::new(objects_root, gateway)),
    };

    let scheduler = Scheduler::new();
    match scheduler.run_now(step.as_ref()) {
        StepOutcome::Completed(record) => {
            for (name, value) in record.fields() {
                println!("{name}: {value}");
            }
            Ok(())
        }
        // Busy is a scheduling signal, not a failure: exit zero.
        StepOutcome::Skipped(reason) => {
            println!("skipped: {reason}");
            Ok(())
        }
        StepOutcome::Failed(err) => Err(err.into()),
    }
}

fn status(args: StatusArgs, config: &Config) -> Result<()> {
    let objects_root = resolve_objects_root(args.objects_root, config)?;
    let snapshot = inspector::snapshot(&paths::pack_dir(&objects_root))?;
    let holder = read_lock_holder(&objects_root)?;

    if args.json {
        let value = serde_json::json!({
            "objects_root": objects_root,
            "pack_count": snapshot.pack_count,
            "total_size_bytes": snapshot.total_size_bytes,
            "maintenance_lock": holder,
        });
        println!("{value}");
    } else {
        println!("objects root:   {}", objects_root.display());
        println!("packs:          {}", snapshot.pack_count);
        println!("pack bytes:     {}", snapshot.total_size_bytes);
        match holder {
            Some(holder) => println!(
                "lock:           held by pid {} since {} ms",
                holder.pid, holder.started_at_ms
            ),
            None => println!("lock:           free"),
        }
    }
    Ok(())
}

fn watch(args: WatchArgs, config: &Config) -> Result<()> {
    let objects_root = resolve_objects_root(args.objects_root, config)?;
    let gateway = Arc::new(GitProcessGateway::new(config.maintenance.command_timeout()));

    let mut scheduler = Scheduler::new();
    scheduler.register(
        Arc::new(PackCompactionStep::new(objects_root.clone(), gateway.clone())),
        config.maintenance.pack_interval(),
    );
    scheduler.register(
        Arc::new(LooseObjectsStep::new(objects_root, gateway)),
        config.maintenance.loose_interval(),
    );

    tracing::info!("maintenance scheduler running");
    // The sender stays alive for the life of the loop; process signals are
    // the only way out, and the lock guard's Drop runs on clean unwinds.
    let (_shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(1);
    run_scheduler_loop(scheduler, shutdown_rx);
    Ok(())
}
