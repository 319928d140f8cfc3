use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console_poller::core::settings::Settings;
use console_poller::daemon;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;

#[derive(Parser)]
#[command(name = "console-poller")]
#[command(author, version, about = "Adaptive poller for the adapter framework management API")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling daemon
    Watch,

    /// Fetch every configured endpoint once
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Fetch a single endpoint instead of the configured ones
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Reload configurations on the server via the daemon
    Reload {
        /// Reload one configuration instead of all of them
        #[arg(long)]
        configuration: Option<String>,
    },

    /// Trigger an immediate poll of every endpoint via D-Bus
    Refresh,

    /// Pause all pollers via D-Bus
    Pause,

    /// Resume all pollers via D-Bus
    Resume,

    /// List endpoints polled by the daemon with their poll state
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(json: bool, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    let debug = Settings::load().map(|s| s.debug).unwrap_or(false);
    init_logging(cli.json_logs, debug);

    match cli.command {
        Commands::Watch => daemon::run().await,
        Commands::Status { json, endpoint } => cli::status::run(json, endpoint).await,
        Commands::Reload { configuration } => cli::control::reload(configuration).await,
        Commands::Refresh => cli::control::refresh().await,
        Commands::Pause => cli::control::pause().await,
        Commands::Resume => cli::control::resume().await,
        Commands::List { json } => cli::control::list(json).await,
        Commands::Completions { .. } => Ok(()),
    }
}
