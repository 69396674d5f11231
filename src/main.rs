// Fleetbatch CLI - run one command across many hosts

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use fleetbatch::executor::{ConnectionPool, ExecutionCoordinator, SshCommandRunner};
use fleetbatch::inventory::{parse_inventory_file, AuthMethod, ConnectionParams, HostResolver, Inventory, ResolvedHost};
use fleetbatch::output::{BatchError, ExecutionEvent, OutputFormat, TerminalOutput};
use fleetbatch::store::{BatchStatus, ExecutionPolicy, ExecutionRequest, MemoryStore};
use fleetbatch::EngineConfig;

#[derive(Parser)]
#[command(
    name = "fleetbatch",
    about = "Run one shell command across many hosts over SSH",
    version,
    disable_colored_help = true,
    term_width = 0,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode - only show failures
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// Run a command on every target host
    Run {
        /// Shell command to execute
        command: String,

        /// Path to the inventory file
        #[arg(short, long)]
        inventory: Option<PathBuf>,

        /// Comma-separated host list (inventory ids, or addresses without an inventory)
        #[arg(short = 'H', long)]
        hosts: Option<String>,

        /// Target every member of an inventory group
        #[arg(short, long, conflicts_with = "hosts")]
        group: Option<String>,

        /// Run hosts one at a time, in order
        #[arg(long)]
        sequential: bool,

        /// Per-attempt command timeout in seconds
        #[arg(short, long, default_value = "300")]
        timeout: i64,

        /// Retries per host after the first attempt
        #[arg(short, long, default_value = "0")]
        retries: i32,

        /// Base delay between retries in seconds
        #[arg(long, default_value = "5")]
        retry_delay: f64,

        /// Stop dispatching new hosts after the first failure
        #[arg(long)]
        stop_on_first_error: bool,

        /// Also retry commands that exit non-zero
        #[arg(long)]
        retry_on_failure: bool,

        /// Maximum hosts running at once
        #[arg(short, long)]
        forks: Option<usize>,

        /// Engine configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the final result as JSON
        #[arg(long)]
        json: bool,

        /// Prompt for an SSH password used on every host
        #[arg(short = 'k', long)]
        ask_pass: bool,

        /// SSH user for hosts that do not set one
        #[arg(short, long)]
        user: Option<String>,
    },

    /// List hosts and groups in an inventory
    Hosts {
        /// Path to the inventory file
        #[arg(short, long)]
        inventory: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            command,
            inventory,
            hosts,
            group,
            sequential,
            timeout,
            retries,
            retry_delay,
            stop_on_first_error,
            retry_on_failure,
            forks,
            config,
            json,
            ask_pass,
            user,
        } => {
            let request = ExecutionRequest::new(current_user(), command)
                .with_policy(if sequential {
                    ExecutionPolicy::Sequential
                } else {
                    ExecutionPolicy::Parallel
                })
                .with_timeout(timeout)
                .with_retries(retries, retry_delay)
                .with_stop_on_first_error(stop_on_first_error)
                .with_retry_on_failure(retry_on_failure);
            let format = if json { OutputFormat::Json } else { OutputFormat::Text };

            run_batch(RunArgs {
                request,
                inventory,
                hosts,
                group,
                forks,
                config,
                ask_pass,
                user,
                format,
                verbose: cli.verbose,
                quiet: cli.quiet,
            })
            .await
        }
        Commands::Hosts { inventory } => list_inventory(&inventory).map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            if let Some(hint) = e.downcast_ref::<BatchError>().and_then(BatchError::suggestion) {
                eprintln!("  {} {}", "hint:".cyan(), hint);
            }
            std::process::exit(1);
        }
    }
}

/// Logs go to stderr so stdout stays clean for `--json`
fn init_tracing(verbose: bool) {
    let default = if verbose { "fleetbatch=debug" } else { "fleetbatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

struct RunArgs {
    request: ExecutionRequest,
    inventory: Option<PathBuf>,
    hosts: Option<String>,
    group: Option<String>,
    forks: Option<usize>,
    config: Option<PathBuf>,
    ask_pass: bool,
    user: Option<String>,
    format: OutputFormat,
    verbose: bool,
    quiet: bool,
}

/// Submit the batch, follow its events, and map the outcome to an exit code
async fn run_batch(args: RunArgs) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(forks) = args.forks {
        config = config.with_max_parallel_hosts(forks);
    }
    if let Some(user) = args.user {
        config = config.with_default_user(user);
    }
    config.validate()?;

    let host_list: Vec<String> = args
        .hosts
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let mut inventory = match &args.inventory {
        Some(path) => parse_inventory_file(path)?,
        None if !host_list.is_empty() => adhoc_inventory(&host_list),
        None => bail!("no inventory given; pass --inventory or --hosts"),
    };

    if args.ask_pass {
        let password = prompt_password("SSH Password: ")?;
        for host in inventory.hosts.values_mut() {
            host.params.auth = AuthMethod::Password {
                password: password.as_str().to_string(),
            };
        }
    }

    let request = match (args.group, host_list.is_empty()) {
        (Some(group), _) => args.request.with_group(group),
        (None, false) => args.request.with_hosts(host_list),
        (None, true) => args.request.with_hosts(inventory.host_ids().into_iter().cloned()),
    };
    let command = request.command.clone();

    let inventory = Arc::new(inventory);
    let pool = Arc::new(ConnectionPool::new(&config));
    let reaper = pool.spawn_reaper(config.reaper_interval());
    let coordinator = ExecutionCoordinator::new(
        Arc::new(MemoryStore::new()),
        HostResolver::new(inventory.clone(), inventory),
        Arc::new(SshCommandRunner::new(pool.clone())),
        config,
    );

    let output = TerminalOutput::new(args.verbose, args.quiet || args.format == OutputFormat::Json);
    let (id, mut events) = coordinator.create_execution_with_events(request).await?;
    let progress = output.create_progress(0);

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    ExecutionEvent::Started { total_hosts, .. } => {
                        progress.suspend(|| output.print_batch_header(&command, *total_hosts));
                        progress.set_length(*total_hosts as u64);
                    }
                    ExecutionEvent::HostRetrying { host_id, attempt, .. } => {
                        progress.set_message(format!("{} attempt {}", host_id, attempt));
                    }
                    ExecutionEvent::HostFinished { host_id, status, .. } => {
                        progress.inc(1);
                        progress.set_message(format!("{} {}", host_id, status));
                    }
                    _ => {}
                }
                if event.is_final() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                progress.println(format!("{}", "Cancelling, waiting for running hosts...".yellow()));
                coordinator.cancel_execution(id).await?;
            }
        }
    }
    progress.finish_and_clear();
    reaper.abort();

    let details = coordinator.get_execution_details(id).await?;
    pool.close_all();

    match args.format {
        OutputFormat::Json => {
            let doc = serde_json::json!({
                "execution": &details.execution,
                "hosts": &details.hosts,
                "summary": details.summary(),
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => output.print_details(&details),
    }

    Ok(match details.execution.status {
        BatchStatus::Completed => 0,
        _ => 2,
    })
}

/// One host per address when no inventory file is used
fn adhoc_inventory(hosts: &[String]) -> Inventory {
    let mut inventory = Inventory::new();
    for spec in hosts {
        let (address, port) = match spec.rsplit_once(':') {
            Some((addr, port)) if !addr.contains(':') => match port.parse() {
                Ok(port) => (addr.to_string(), port),
                Err(_) => (spec.clone(), 22),
            },
            _ => (spec.clone(), 22),
        };
        inventory.add_host(ResolvedHost {
            id: spec.clone(),
            name: spec.clone(),
            params: ConnectionParams::new(address, "", AuthMethod::Agent).with_port(port),
        });
    }
    inventory
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "fleetbatch".to_string())
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    // Prompt on stderr so it appears even with redirected stdout
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    let password = Zeroizing::new(rpassword::read_password().context("failed to read password")?);
    eprintln!();

    if password.trim().is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}

fn list_inventory(path: &Path) -> Result<()> {
    let inventory = parse_inventory_file(path)?;

    println!("{} {} host(s)", "Found".green(), inventory.hosts.len());
    println!();

    for id in inventory.host_ids() {
        let Some(host) = inventory.hosts.get(id) else { continue };
        println!("  {} {}", "•".cyan(), host.name.white().bold());
        println!("    {} {}", "Address:".dimmed(), host.params.address);
        println!("    {} {}", "Port:".dimmed(), host.params.port);
        if !host.params.username.is_empty() {
            println!("    {} {}", "User:".dimmed(), host.params.username);
        }
        println!("    {} {:?}", "Auth:".dimmed(), host.params.auth);
        println!();
    }

    println!("{}:", "Groups".green());
    let mut groups: Vec<_> = inventory.groups.iter().collect();
    groups.sort_by(|a, b| a.0.cmp(b.0));
    for (name, members) in groups {
        println!("  {} {} ({} hosts)", "•".cyan(), name, members.len());
    }

    Ok(())
}
