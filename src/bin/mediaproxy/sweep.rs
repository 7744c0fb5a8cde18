use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use media_proxy::db::build_pool;
use media_proxy::tasks::{deduplicate_attachments, expire_pending_attachments};
use media_proxy::SweepSettings;

#[derive(Parser)]
pub struct SweepArgs {
    #[command(subcommand)]
    pub command: SweepCommands,
}

#[derive(Subcommand)]
pub enum SweepCommands {
    /// Remove duplicate attachment rows
    Dedup,
    /// Remove expired, unclaimed pending uploads
    Pending,
}

pub async fn handle_sweep_command(args: SweepArgs) -> Result<()> {
    let settings = SweepSettings::from_env();
    let database_url = settings
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
    let pool = build_pool(&database_url)?;

    match args.command {
        SweepCommands::Dedup => {
            let removed = deduplicate_attachments(&pool).await?;
            println!("Removed {removed} duplicate attachments.");
        }
        SweepCommands::Pending => {
            let removed =
                expire_pending_attachments(&pool, Utc::now().naive_utc(), settings.pending_expiry)
                    .await?;
            println!("Removed {removed} expired pending attachments.");
        }
    }

    Ok(())
}
