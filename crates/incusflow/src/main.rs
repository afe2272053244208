mod commands;

use clap::{ArgAction, Parser, Subcommand};
use incusflow_config::Settings;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "incusflow")]
#[command(about = "Declarative state reconciliation for Incus", long_about = None)]
struct Cli {
    /// incus client binary
    #[arg(long = "incus", env = "INCUS_BIN", global = true)]
    incus: Option<String>,

    /// Settings file (default: discovered)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output on stderr (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the requests in a file (`-` reads stdin)
    Apply {
        file: PathBuf,
        /// Plan only; nothing is changed
        #[arg(long)]
        check: bool,
    },
    /// Read-only lookups
    #[command(subcommand)]
    Query(QueryCommands),
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum QueryCommands {
    /// Raw attributes of an instance
    Config {
        name: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Raw attributes with runtime state
    Info {
        name: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Instances matching the filters
    List {
        filters: Vec<String>,
        #[arg(long)]
        all_projects: bool,
        /// Every remote speaking the incus protocol
        #[arg(long)]
        all_remotes: bool,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// `incus query <path>`
    Raw {
        path: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

#[derive(clap::Args, Clone, Default)]
struct ScopeArgs {
    #[arg(long)]
    remote: Option<String>,
    #[arg(long)]
    project: Option<String>,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if matches!(cli.command, Commands::Version) {
        println!("incusflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut settings: Settings = incusflow_config::load(cli.config.as_deref())?;
    if let Some(binary) = cli.incus {
        settings.binary = binary;
    }
    tracing::debug!("Using incus client {}", settings.binary);

    let host = commands::Host::new(settings)?;
    let success = match cli.command {
        Commands::Apply { file, check } => commands::apply::handle(&host, &file, check)?,
        Commands::Query(query) => {
            let (scope, lookup) = match query {
                QueryCommands::Config { name, scope } => (scope, commands::query::Lookup::Config(name)),
                QueryCommands::Info { name, scope } => (scope, commands::query::Lookup::Info(name)),
                QueryCommands::List {
                    filters,
                    all_projects,
                    all_remotes,
                    scope,
                } => (
                    scope,
                    commands::query::Lookup::List(incusflow_incus::ListFilter {
                        filters,
                        all_projects,
                        all_remotes,
                    }),
                ),
                QueryCommands::Raw { path, scope } => (scope, commands::query::Lookup::Raw(path)),
            };
            commands::query::handle(&host, scope.remote, scope.project, lookup)?
        }
        Commands::Version => true,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}
