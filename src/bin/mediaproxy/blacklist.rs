use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{presets, Attribute, Cell, Table};
use media_proxy::{BlacklistStore, MediaCacheSettings};

#[derive(Parser)]
pub struct BlacklistArgs {
    #[command(subcommand)]
    pub command: BlacklistCommands,
}

#[derive(Subcommand)]
pub enum BlacklistCommands {
    /// List blacklisted URLs
    List,
    /// Blacklist a URL so it is never fetched
    Add {
        url: String,
        #[clap(default_value = "added by operator")]
        reason: String,
    },
    /// Check whether a URL is blacklisted
    Check { url: String },
}

pub async fn handle_blacklist_command(args: BlacklistArgs) -> Result<()> {
    let settings = MediaCacheSettings::from_env();
    let store = BlacklistStore::load(settings.blacklist_path()).await;

    match args.command {
        BlacklistCommands::List => {
            let urls = store.urls().await;

            let mut table = Table::new();
            table.load_preset(presets::UTF8_FULL);
            table.set_header(vec![Cell::new("URL").add_attribute(Attribute::Bold)]);
            for url in &urls {
                table.add_row(vec![Cell::new(url)]);
            }

            println!("{table}");
            println!("{} blacklisted URLs", urls.len());
        }
        BlacklistCommands::Add { url, reason } => {
            if store.add(&url, &reason).await {
                println!("Blacklisted {url}");
            } else {
                println!("{url} was already blacklisted");
            }
        }
        BlacklistCommands::Check { url } => {
            if store.is_blacklisted(&url).await {
                println!("{url} is blacklisted");
            } else {
                println!("{url} is not blacklisted");
            }
        }
    }

    Ok(())
}
