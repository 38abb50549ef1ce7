mod classifier;
mod config;
mod cooldown;
mod daemon;
mod data_dir;
mod events;
mod governor;
mod monitored;
mod proc_scan;
mod registry;
mod rotate;
mod signals;
mod status;
mod store;
mod supervisor;

use chrono::Local;
use clap::{Parser, Subcommand};
use config::{NodeId, SupervisorConfig};
use monitored::Membership;
use registry::TerminateOutcome;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use supervisor::{EnrollmentPolicy, Supervisor, SupervisorError};

/// Keeps a fleet of worker processes alive: restarts workers that die, hang,
/// or fall below a success-rate threshold, with a per-node restart cooldown.
#[derive(Parser, Debug)]
#[command(name = "nodekeeper", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "nodekeeper.toml", global = true)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a worker, or every configured worker
    Start {
        #[arg(value_name = "NODE|all")]
        target: Target,
    },
    /// Stop a worker, or every configured worker
    Stop {
        #[arg(value_name = "NODE|all")]
        target: Target,
    },
    /// Restart a worker, or every configured worker
    Restart {
        #[arg(value_name = "NODE|all")]
        target: Target,
    },
    /// Show worker state, health and cooldown
    Status {
        node: Option<NodeId>,
        #[arg(long)]
        json: bool,
    },
    /// Control the supervision daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },
    /// Edit the set of nodes the daemon supervises
    Monitor {
        #[command(subcommand)]
        action: MonitorCommand,
    },
    /// Outcome counts and success rate over a trailing window
    Rates {
        node: Option<NodeId>,
        /// Window length in minutes (default: monitor.rate_window_secs)
        #[arg(long, value_name = "MINUTES")]
        window_mins: Option<u64>,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Launch the supervision daemon in the background
    Start {
        /// Monitor the whole fleet, starting workers that are not running
        #[arg(long)]
        force: bool,
    },
    /// Stop the supervision daemon
    Stop,
    /// Show daemon state, monitored nodes and recent log entries
    Status {
        #[arg(long, default_value_t = 10)]
        lines: usize,
        #[arg(long)]
        json: bool,
    },
    /// Run the supervision loop in the foreground
    #[command(hide = true)]
    Run {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum MonitorCommand {
    Add { node: NodeId },
    Remove { node: NodeId },
    List,
}

#[derive(Debug, Clone, Copy)]
enum Target {
    All,
    Node(NodeId),
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            Ok(Target::All)
        } else {
            s.parse().map(Target::Node)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("nodekeeper=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nodekeeper=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = SupervisorConfig::load(&cli.config).map_err(|e| e.to_string())?;
    let command = match cli.command {
        Command::Config => return handle_config(&config),
        other => other,
    };
    config.validate().map_err(|e| e.to_string())?;
    let sup = Supervisor::new(&config).map_err(|e| e.to_string())?;

    match command {
        Command::Start { target } => handle_start(&sup, target),
        Command::Stop { target } => handle_stop(&sup, target),
        Command::Restart { target } => handle_restart(&sup, target),
        Command::Status { node, json } => handle_status(&sup, node, json),
        Command::Daemon { action } => match action {
            DaemonCommand::Start { force } => handle_daemon_start(&sup, &cli.config, force),
            DaemonCommand::Stop => handle_daemon_stop(&sup),
            DaemonCommand::Status { lines, json } => handle_daemon_status(&sup, lines, json),
            DaemonCommand::Run { force } => sup.serve(force).await.map_err(|e| match e {
                SupervisorError::Daemon(daemon::DaemonError::Lock { .. }) => {
                    format!("another daemon is already running ({e})")
                }
                other => other.to_string(),
            }),
        },
        Command::Monitor { action } => handle_monitor(&sup, action),
        Command::Rates { node, window_mins } => handle_rates(&sup, node, window_mins),
        Command::Config => handle_config(&config),
    }
}

fn targets(sup: &Supervisor, target: Target) -> Result<Vec<NodeId>, String> {
    match target {
        Target::All => Ok(sup.fleet().to_vec()),
        Target::Node(node) => Ok(vec![sup.require(node).map_err(|e| e.to_string())?]),
    }
}

/// Run `op` for every target, reporting each failure and failing if any did.
fn for_each_target(
    sup: &Supervisor,
    target: Target,
    mut op: impl FnMut(NodeId) -> Result<(), SupervisorError>,
) -> Result<(), String> {
    let nodes = targets(sup, target)?;
    let mut failed = Vec::new();
    for node in nodes {
        if let Err(e) = op(node) {
            eprintln!("{e}");
            failed.push(node.to_string());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("failed for node(s): {}", failed.join(", ")))
    }
}

fn handle_start(sup: &Supervisor, target: Target) -> Result<(), String> {
    for_each_target(sup, target, |node| {
        match sup.start_worker(node, EnrollmentPolicy::AutoEnroll) {
            Ok(record) => {
                println!("Node {node} started (pid {})", record.pid);
                Ok(())
            }
            // Reported, not a failure
            Err(SupervisorError::AlreadyRunning { pid, .. }) => {
                println!("Node {node} is already running (pid {pid})");
                Ok(())
            }
            Err(e) => Err(e),
        }
    })
}

fn handle_stop(sup: &Supervisor, target: Target) -> Result<(), String> {
    for_each_target(sup, target, |node| {
        let report = sup.stop_worker(node, EnrollmentPolicy::AutoEnroll)?;
        match report.outcome {
            TerminateOutcome::GracefullyStopped => println!("Node {node} stopped"),
            TerminateOutcome::ForceKilled => println!("Node {node} force killed"),
            TerminateOutcome::AlreadyDead => println!("Node {node} is not running"),
            TerminateOutcome::StillAlive => {
                return Err(SupervisorError::StillAlive {
                    node,
                    pid: report.pid.unwrap_or_default(),
                })
            }
        }
        Ok(())
    })
}

fn handle_restart(sup: &Supervisor, target: Target) -> Result<(), String> {
    for_each_target(sup, target, |node| {
        let record = sup.restart_worker(node, "Manual restart")?;
        println!("Node {node} restarted (pid {})", record.pid);
        Ok(())
    })
}

fn handle_status(sup: &Supervisor, node: Option<NodeId>, json: bool) -> Result<(), String> {
    let nodes = match node {
        Some(n) => targets(sup, Target::Node(n))?,
        None => sup.fleet().to_vec(),
    };
    let now = Local::now().timestamp();
    let rows = nodes
        .into_iter()
        .map(|n| status::worker_status(sup, n, now))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", status::to_json(&rows).map_err(|e| e.to_string())?);
    } else {
        print!("{}", status::render_workers(&rows));
    }
    Ok(())
}

fn handle_daemon_start(sup: &Supervisor, config_path: &Path, force: bool) -> Result<(), String> {
    if let Some(pid) = sup.daemon().running_pid() {
        return Err(format!("daemon is already running (pid {pid})"));
    }
    let pid = sup
        .daemon()
        .spawn_detached(config_path, force)
        .map_err(|e| e.to_string())?;

    // Catch immediate startup failures such as a held lock
    std::thread::sleep(Duration::from_millis(500));
    if !proc_scan::is_alive(pid) {
        let output = store::tail_lines(&sup.data_dir().daemon_output(), 5).unwrap_or_default();
        return Err(format!(
            "daemon exited during startup: {}",
            if output.is_empty() { "no output".to_string() } else { output.join(" | ") }
        ));
    }
    println!(
        "Daemon started (pid {pid}){}",
        if force { ", monitoring the whole fleet" } else { "" }
    );
    Ok(())
}

fn handle_daemon_stop(sup: &Supervisor) -> Result<(), String> {
    // The loop only notices SIGTERM at the next interval boundary
    let cfg = sup.config();
    let timeout =
        Duration::from_secs(cfg.monitor.check_interval_secs + cfg.process.grace_timeout_secs);
    match sup.daemon().stop(timeout).map_err(|e| e.to_string())? {
        TerminateOutcome::GracefullyStopped => println!("Daemon stopped"),
        TerminateOutcome::ForceKilled => println!("Daemon force killed"),
        TerminateOutcome::AlreadyDead => println!("Daemon is not running"),
        TerminateOutcome::StillAlive => return Err("daemon could not be stopped".to_string()),
    }
    Ok(())
}

fn handle_daemon_status(sup: &Supervisor, lines: usize, json: bool) -> Result<(), String> {
    let report = status::daemon_status(sup, lines).map_err(|e| e.to_string())?;
    if json {
        println!("{}", status::to_json(&report).map_err(|e| e.to_string())?);
    } else {
        print!("{}", status::render_daemon(&report));
    }
    Ok(())
}

fn handle_monitor(sup: &Supervisor, action: MonitorCommand) -> Result<(), String> {
    match action {
        MonitorCommand::Add { node } => match sup.enroll(node).map_err(|e| e.to_string())? {
            Membership::Added => println!("Node {node} added to monitoring"),
            _ => println!("Node {node} is already monitored"),
        },
        MonitorCommand::Remove { node } => {
            sup.require(node).map_err(|e| e.to_string())?;
            match sup.unenroll(node).map_err(|e| e.to_string())? {
                Membership::Removed => println!("Node {node} removed from monitoring"),
                _ => println!("Node {node} is not monitored"),
            }
        }
        MonitorCommand::List => {
            let nodes = sup.monitored().list().map_err(|e| e.to_string())?;
            if nodes.is_empty() {
                println!("No nodes monitored");
            }
            for node in nodes {
                println!("{node}");
            }
        }
    }
    Ok(())
}

/// Window length in seconds from `--window` minutes, or the configured default.
fn window_secs(window_mins: Option<u64>, default_secs: u64) -> Result<u64, String> {
    let secs = match window_mins {
        Some(m) => m
            .checked_mul(60)
            .ok_or_else(|| format!("window of {m} minutes is too large"))?,
        None => default_secs,
    };
    if secs == 0 {
        return Err("window must be at least one minute".to_string());
    }
    Ok(secs)
}

fn handle_rates(sup: &Supervisor, node: Option<NodeId>, window_mins: Option<u64>) -> Result<(), String> {
    let window_secs = window_secs(window_mins, sup.config().monitor.rate_window_secs)?;
    let nodes = match node {
        Some(n) => targets(sup, Target::Node(n))?,
        None => sup.fleet().to_vec(),
    };
    let now = Local::now().timestamp();
    for node in nodes {
        let window = sup.rates(node, window_secs, now).map_err(|e| e.to_string())?;
        println!("{}", status::render_rates(node, &window, window_secs));
    }
    Ok(())
}

fn handle_config(config: &SupervisorConfig) -> Result<(), String> {
    let rendered = toml::to_string_pretty(config).map_err(|e| e.to_string())?;
    print!("{rendered}");
    if let Err(e) = config.validate() {
        eprintln!("Warning: {e}");
    }
    Ok(())
}
