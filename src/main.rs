//! pixels - disposable Linux containers on TrueNAS.

use clap::{Parser, Subcommand};

mod cache;
mod commands;
mod config;
mod egress;
mod errors;
mod provision;
mod retry;
mod ssh;
mod truenas;

use config::Config;
use errors::Result;

/// Create, checkpoint, and restore disposable containers on a TrueNAS
/// appliance.
#[derive(Parser)]
#[command(name = "pixels", version, about = "Disposable Linux containers on TrueNAS")]
struct Cli {
    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TrueNAS host (overrides config).
    #[arg(long, global = true)]
    host: Option<String>,

    /// TrueNAS API key (overrides config).
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// TrueNAS username (overrides config).
    #[arg(short = 'u', long, global = true)]
    username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new pixel.
    Create(commands::create::CreateOpts),

    /// Permanently destroy a pixel and all its checkpoints.
    Destroy(commands::destroy::DestroyOpts),

    /// Start a stopped pixel.
    Start { name: String },

    /// Stop a running pixel.
    Stop { name: String },

    /// List all pixels.
    List,

    /// Manage pixel checkpoints (ZFS snapshots).
    #[command(subcommand, visible_alias = "cp")]
    Checkpoint(commands::checkpoint::CheckpointCmd),

    /// Open a persistent SSH session (zmx).
    Console(commands::console::ConsoleOpts),

    /// Run a command in a pixel via SSH.
    Exec(commands::exec::ExecOpts),

    /// Manage container network egress policies.
    #[command(subcommand)]
    Network(commands::network::NetworkCmd),

    /// Show provisioning step status.
    Status { name: String },

    /// List zmx sessions in a container.
    Sessions { name: String },

    /// Authorize this machine's SSH key on an existing pixel.
    Authorize { name: String },
}

fn install_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "pixels=debug" } else { "pixels=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut cfg = Config::load()?;
    if let Some(host) = cli.host {
        cfg.truenas.host = host;
    }
    if let Some(api_key) = cli.api_key {
        cfg.truenas.api_key = api_key;
    }
    if let Some(username) = cli.username {
        cfg.truenas.username = username;
    }

    match cli.command {
        Commands::Create(opts) => commands::create::run(&cfg, &opts, cli.verbose).await?,
        Commands::Destroy(opts) => commands::destroy::run(&cfg, &opts).await?,
        Commands::Start { name } => commands::start::run(&cfg, &name).await?,
        Commands::Stop { name } => commands::stop::run(&cfg, &name).await?,
        Commands::List => commands::list::run(&cfg).await?,
        Commands::Checkpoint(cmd) => commands::checkpoint::run(&cfg, &cmd).await?,
        Commands::Console(opts) => commands::console::run(&cfg, &opts, cli.verbose).await?,
        Commands::Exec(opts) => {
            // The remote exit code becomes our exit code.
            return commands::exec::run(&cfg, &opts).await;
        }
        Commands::Network(cmd) => commands::network::run(&cfg, &cmd).await?,
        Commands::Status { name } => commands::status::run(&cfg, &name).await?,
        Commands::Sessions { name } => commands::sessions::run(&cfg, &name).await?,
        Commands::Authorize { name } => commands::authorize::run(&cfg, &name).await?,
    }
    Ok(0)
}
