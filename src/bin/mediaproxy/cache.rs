use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{presets, Attribute, Cell, Color, Table};
use indicatif::{ProgressBar, ProgressStyle};
use media_proxy::retriever::CacheEntry;
use media_proxy::{cache_key, MediaCacheSettings, StorageEvictionManager};
use std::time::Duration;

#[derive(Parser)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Show cache size against the configured limit
    Status,
    /// Evict least recently accessed files until the cache fits
    Evict {
        /// Shrink to this many bytes instead of the configured limit
        #[clap(long)]
        target_bytes: Option<u64>,
    },
    /// Show the cache key and file for a URL
    Key { url: String },
}

pub async fn handle_cache_command(args: CacheArgs) -> Result<()> {
    let settings = MediaCacheSettings::from_env();

    match args.command {
        CacheCommands::Status => {
            let manager = StorageEvictionManager::new(
                &settings.cache_directory,
                settings.storage_limit_bytes,
            );
            let files = manager.cache_files().await?;
            let status = manager.status().await?;

            let mut table = Table::new();
            table.load_preset(presets::UTF8_FULL);
            table.set_header(vec![
                Cell::new("Property").add_attribute(Attribute::Bold),
                Cell::new("Value").add_attribute(Attribute::Bold),
            ]);
            table.add_row(vec![
                Cell::new("Directory"),
                Cell::new(settings.cache_directory.display()),
            ]);
            table.add_row(vec![Cell::new("Files"), Cell::new(files.len())]);
            table.add_row(vec![
                Cell::new("Size (bytes)"),
                Cell::new(status.folder_size_bytes),
            ]);
            table.add_row(vec![
                Cell::new("Limit (bytes)"),
                Cell::new(status.storage_limit_bytes),
            ]);
            table.add_row(vec![Cell::new("Usage"), Cell::new(status.usage_bar(30))]);
            table.add_row(vec![
                Cell::new("Limit Reached"),
                if status.limit_reached {
                    Cell::new("Yes").fg(Color::Red)
                } else {
                    Cell::new("No").fg(Color::Green)
                },
            ]);

            println!("{table}");
        }
        CacheCommands::Evict { target_bytes } => {
            let budget = target_bytes.unwrap_or(settings.storage_limit_bytes);
            let manager = StorageEvictionManager::new(&settings.cache_directory, budget);

            let spinner = if atty::is(atty::Stream::Stdout) {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} [{elapsed_precise}] {wide_msg}")
                        .expect("Failed to create spinner template"),
                );
                pb.enable_steady_tick(Duration::from_millis(100));
                pb.set_message(format!("Evicting down to {budget} bytes..."));
                Some(pb)
            } else {
                println!("Evicting down to {budget} bytes...");
                None
            };

            let report = manager.enforce_budget(0).await;

            if let Some(pb) = spinner {
                pb.finish_and_clear();
            }

            let report = report?;
            println!(
                "Evicted {} of {} files ({} bytes); {} bytes remain.",
                report.removed_files, report.scanned, report.removed_bytes, report.remaining_bytes
            );
        }
        CacheCommands::Key { url } => {
            let key = cache_key::derive(&url);
            println!("key:  {key}");
            println!(
                "path: {}",
                cache_key::cache_path(&settings.cache_directory, &url).display()
            );

            match CacheEntry::lookup(&settings.cache_directory, &url).await? {
                Some(entry) => println!("cached: yes ({} bytes)", entry.length),
                None => println!("cached: no"),
            }
        }
    }

    Ok(())
}
