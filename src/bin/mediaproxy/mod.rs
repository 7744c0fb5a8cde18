use anyhow::{Context, Result};
use clap::Parser;
use media_proxy::{MediaCacheSettings, ServerSettings};

mod blacklist;
mod cache;
mod supervisor;
mod sweep;
mod system;

use blacklist::{handle_blacklist_command, BlacklistArgs};
use cache::{handle_cache_command, CacheArgs};
use supervisor::{sibling_binary, ManagedChild};
use sweep::{handle_sweep_command, SweepArgs};
use system::{handle_init, handle_migrations};

#[derive(Parser)]
pub enum Commands {
    /// Create the media cache directory
    Init,
    /// Run attachment database migrations
    Migrate,
    /// Inspect or shrink the media cache
    Cache(CacheArgs),
    /// Inspect or extend the URL blacklist
    Blacklist(BlacklistArgs),
    /// Run an attachment sweep once
    Sweep(SweepArgs),
    /// Start the proxy server and background tasks
    Server,
    /// [Internal] Run the proxy server
    #[command(hide = true)]
    App,
}

#[derive(Parser)]
#[command(name = "mediaproxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Caching media proxy for LiventCord", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// The process manager for the `server` command.
fn handle_server_command() -> Result<()> {
    log::info!("[Manager] Starting media proxy...");

    let tasks = ManagedChild::spawn("tasks", &sibling_binary("tasks")?, &[])?;
    let app = std::env::current_exe()
        .context("failed to locate current executable")
        .and_then(|exe| ManagedChild::spawn("proxy", &exe, &["app"]));
    let app = match app {
        Ok(app) => app,
        Err(e) => {
            tasks.terminate();
            return Err(e);
        }
    };

    supervisor::run(vec![app, tasks])
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    env_logger::init();
    dotenvy::dotenv().ok();

    match args.command {
        Commands::Init => handle_init().await.expect("init failed"),
        Commands::Migrate => handle_migrations().await.expect("migrate failed"),
        Commands::Cache(args) => handle_cache_command(args)
            .await
            .expect("cache command failed"),
        Commands::Blacklist(args) => handle_blacklist_command(args)
            .await
            .expect("blacklist command failed"),
        Commands::Sweep(args) => handle_sweep_command(args)
            .await
            .expect("sweep command failed"),
        Commands::Server => handle_server_command().expect("server manager failed"),
        Commands::App => {
            media_proxy::server::start(MediaCacheSettings::from_env(), ServerSettings::from_env())
                .await
                .expect("proxy server failed")
        }
    }
}
