// src/main.rs

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use pacflow::engine::memory::MemoryEngine;
use pacflow::engine::InstallReason;
use pacflow::{event_channel, Config, EventReceiver, EventSender, Orchestrator, TransactionOptions};
use std::collections::HashSet;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use tracing::info;

#[derive(Parser)]
#[command(name = "pacflow")]
#[command(author, version, about = "Package transaction front end with progress events", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/pacflow.toml")]
    config: PathBuf,

    /// Package catalog (default: <db_path>/catalog.json)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Write raw engine log lines to this file
    #[arg(long)]
    diagnostic_log: Option<PathBuf>,

    /// Run without an event consumer
    #[arg(long)]
    detached: bool,

    /// Print events and query results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Flags shared by every transaction
#[derive(Args)]
struct TransactionArgs {
    /// Skip dependency checks
    #[arg(long)]
    nodeps: bool,
    /// Only modify database entries, not package files
    #[arg(long)]
    dbonly: bool,
    /// Bypass version checks
    #[arg(long)]
    force: bool,
}

impl TransactionArgs {
    fn apply(&self, base: &TransactionOptions) -> TransactionOptions {
        TransactionOptions {
            no_deps: base.no_deps || self.nodeps,
            db_only: base.db_only || self.dbonly,
            force: base.force || self.force,
            ..base.clone()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install packages or groups from the sync repositories
    Install {
        /// Package or group names
        #[arg(required = true)]
        names: Vec<String>,
        /// Never install this package
        #[arg(long = "conflict", value_name = "NAME")]
        conflicts: Vec<String>,
        /// Skip targets that are already up to date
        #[arg(long)]
        needed: bool,
        /// Mark targets as installed as dependencies
        #[arg(long, conflicts_with = "asexplicit")]
        asdeps: bool,
        /// Mark targets as explicitly installed
        #[arg(long)]
        asexplicit: bool,
        /// Retrieve packages without installing them
        #[arg(long)]
        downloadonly: bool,
        #[command(flatten)]
        common: TransactionArgs,
    },
    /// Install or upgrade from package archives
    Upgrade {
        /// Package archive paths
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[command(flatten)]
        common: TransactionArgs,
    },
    /// Remove installed packages
    Remove {
        /// Package names
        #[arg(required = true)]
        names: Vec<String>,
        /// Also remove packages that depend on the targets
        #[arg(long)]
        cascade: bool,
        /// Remove unneeded dependencies; twice to recurse
        #[arg(short = 's', long, action = clap::ArgAction::Count)]
        recursive: u8,
        /// Also remove explicitly installed dependencies
        #[arg(long)]
        unneeded: bool,
        /// Do not keep backups of configuration files
        #[arg(long)]
        nosave: bool,
        #[command(flatten)]
        common: TransactionArgs,
    },
    /// Refresh every sync database
    Refresh,
    /// Show package details from the sync repositories
    Info {
        /// Package names (all packages if omitted)
        names: Vec<String>,
    },
    /// Check whether a package is installed
    Query {
        /// Package name
        name: String,
    },
}

/// Print events until the sender goes away
fn spawn_consumer(rx: EventReceiver, json: bool) -> JoinHandle<()> {
    thread::spawn(move || {
        for event in rx.iter() {
            if json {
                match serde_json::to_string(&*event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("Failed to encode event: {}", e),
                }
            } else {
                println!("{}", *event);
            }
        }
    })
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(command) = cli.command else {
        // No command provided, show help
        println!("Pacflow v{}", env!("CARGO_PKG_VERSION"));
        println!("Run 'pacflow --help' for usage information");
        return Ok(());
    };

    let mut config = Config::load(&cli.config)?;
    if let Some(path) = cli.diagnostic_log {
        config.diagnostic_log = Some(path);
    }

    let catalog = cli
        .catalog
        .unwrap_or_else(|| config.db_path.join("catalog.json"));
    let engine = MemoryEngine::from_catalog_file(&catalog)?;

    let (events, consumer) = if cli.detached {
        (EventSender::detached(), None)
    } else {
        let (tx, rx) = event_channel(config.events.capacity);
        (tx, Some(spawn_consumer(rx, cli.json)))
    };
    let events = events.with_drain_timeout(config.events.drain_timeout());

    let mut orchestrator = Orchestrator::new(engine, &config, events)?;
    let base = config.options.clone();

    let result = match command {
        Commands::Install {
            names,
            conflicts,
            needed,
            asdeps,
            asexplicit,
            downloadonly,
            common,
        } => {
            info!("Installing {}", names.join(", "));
            let mut options = common.apply(&base);
            options.needed |= needed;
            options.download_only |= downloadonly;
            if asdeps {
                options.mode = Some(InstallReason::Depend);
            } else if asexplicit {
                options.mode = Some(InstallReason::Explicit);
            }
            let conflicts: HashSet<String> = conflicts.into_iter().collect();
            orchestrator
                .install(&names, &conflicts, &options)
                .map_err(|e| format!("Can't install packages: {}", e))
        }
        Commands::Upgrade { paths, common } => {
            let options = common.apply(&base);
            orchestrator
                .upgrade_from_archives(&paths, &options)
                .map_err(|e| format!("Can't upgrade packages: {}", e))
        }
        Commands::Remove {
            names,
            cascade,
            recursive,
            unneeded,
            nosave,
            common,
        } => {
            info!("Removing {}", names.join(", "));
            let mut options = common.apply(&base);
            options.cascade |= cascade;
            options.recursive = options.recursive.max(recursive);
            options.unneeded |= unneeded;
            options.no_save |= nosave;
            orchestrator
                .remove(&names, &options)
                .map_err(|e| format!("Can't remove packages: {}", e))
        }
        Commands::Refresh => orchestrator
            .refresh()
            .map_err(|e| format!("Can't refresh databases: {}", e)),
        Commands::Info { names } => match orchestrator.packages_info(&names) {
            Ok(infos) => {
                for info in &infos {
                    if cli.json {
                        println!("{}", serde_json::to_string(info)?);
                    } else {
                        println!(
                            "{}/{} {}{}",
                            info.repository,
                            info.name,
                            info.version,
                            if info.installed { " [installed]" } else { "" }
                        );
                    }
                }
                Ok(())
            }
            Err(e) => Err(format!("Can't get package info: {}", e)),
        },
        Commands::Query { name } => {
            let installed = orchestrator.is_installed(&name);
            if cli.json {
                println!("{}", serde_json::json!({ "name": name, "installed": installed }));
            } else if installed {
                println!("{} is installed", name);
            } else {
                println!("{} is not installed", name);
            }
            Ok(())
        }
    };

    if let Err(message) = result {
        // Fail loud and stop; does not return
        orchestrator.fatal(message.clone());
        return Err(anyhow::anyhow!(message));
    }

    // Dropping the orchestrator closes the channel so the consumer finishes
    drop(orchestrator);
    if let Some(consumer) = consumer {
        if consumer.join().is_err() {
            return Err(anyhow::anyhow!("Event consumer panicked"));
        }
    }

    Ok(())
}
