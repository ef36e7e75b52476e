use std::path::PathBuf;

use clap::{Parser, Subcommand};

use custos_agent::agent;
use custos_agent::config::AgentConfig;
use custos_agent::coordinator::CoordinatorClient;
use custos_agent::evidence::EvidenceStore;
use custos_agent::healer::RunbookSet;
use custos_agent::signing::EvidenceSigner;
use custos_agent::util::logging::init_tracing;

#[derive(Parser)]
#[command(name = "custos")]
#[command(version, about = "Pull-only compliance agent for hardened appliances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent management commands
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Runbook tooling
    #[command(subcommand)]
    Runbook(RunbookCommands),

    /// Evidence tooling
    #[command(subcommand)]
    Evidence(EvidenceCommands),

    /// Order tooling
    #[command(subcommand)]
    Order(OrderCommands),

    /// Configuration tooling
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Run the agent daemon
    Run {
        /// Run without any interactive output
        #[arg(long, default_value_t = false)]
        headless: bool,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Install the agent as a system service
    Install {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Uninstall the agent service
    Uninstall,

    /// Check agent service status
    Status,
}

#[derive(Subcommand)]
enum RunbookCommands {
    /// Validate every runbook in a directory
    Validate {
        /// Path to the runbooks directory
        dir: PathBuf,
    },

    /// List validated runbooks in a directory
    List {
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum EvidenceCommands {
    /// Verify the detached signature of one persisted bundle
    Verify {
        /// Directory containing bundle.json and bundle.sig
        bundle_dir: PathBuf,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Walk and verify the evidence hash chain
    Chain {
        /// Evidence root directory
        root: PathBuf,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// Query the coordinator for the status of one order
    Status {
        order_id: String,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Parse and validate the agent configuration
    Validate {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AgentConfig> {
    let path = path.unwrap_or_else(AgentConfig::default_path);
    AgentConfig::load(&path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(cmd) => match cmd {
            // the daemon initializes tracing itself from the config
            AgentCommands::Run { headless, config } => agent::run(config, headless).await?,
            AgentCommands::Install { config } => {
                init_tracing("info");
                agent::install_service(config.as_deref())?
            }
            AgentCommands::Uninstall => {
                init_tracing("info");
                agent::uninstall_service()?
            }
            AgentCommands::Status => agent::status_service()?,
        },
        Commands::Runbook(cmd) => {
            init_tracing("warn");
            match cmd {
                RunbookCommands::Validate { dir } => {
                    let (set, failures) = RunbookSet::load_dir(&dir);
                    println!("{} runbook(s) valid", set.len());
                    for (path, err) in &failures {
                        println!("REFUSED {}: {err}", path.display());
                    }
                    if !failures.is_empty() {
                        std::process::exit(1);
                    }
                }
                RunbookCommands::List { dir } => {
                    let (set, _) = RunbookSet::load_dir(&dir);
                    for id in set.ids() {
                        println!("{id}");
                    }
                }
            }
        }
        Commands::Evidence(cmd) => {
            init_tracing("warn");
            match cmd {
                EvidenceCommands::Verify { bundle_dir, config } => {
                    let config = load_config(config)?;
                    let signer = EvidenceSigner::load(&config.signing_key_path)?;
                    let ok = EvidenceStore::verify_files(
                        &bundle_dir.join("bundle.json"),
                        &bundle_dir.join("bundle.sig"),
                        &signer.verifying_key(),
                    )?;
                    if ok {
                        println!("signature valid");
                    } else {
                        println!("SIGNATURE INVALID");
                        std::process::exit(1);
                    }
                }
                EvidenceCommands::Chain { root } => {
                    let store = EvidenceStore::open(&root)?;
                    let report = store.verify_chain()?;
                    println!(
                        "{} bundle(s) on disk, chain length {}",
                        report.bundles_seen, report.chain_length
                    );
                    if report.intact {
                        println!("chain intact");
                    } else {
                        match report.broken_at {
                            Some(hash) => println!("CHAIN BROKEN at {hash}"),
                            None => println!("CHAIN INCOMPLETE: bundles outside the chain"),
                        }
                        std::process::exit(1);
                    }
                }
            }
        }
        Commands::Order(cmd) => {
            init_tracing("warn");
            match cmd {
                OrderCommands::Status { order_id, config } => {
                    let config = load_config(config)?;
                    let client = CoordinatorClient::new(&config)?;
                    let status = client.order_status(&order_id).await?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
        }
        Commands::Config(cmd) => {
            init_tracing("warn");
            match cmd {
                ConfigCommands::Validate { config } => {
                    let config = load_config(config)?;
                    println!("config valid for site {}", config.site_id);
                }
            }
        }
        Commands::Version => {
            println!("custos version {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
