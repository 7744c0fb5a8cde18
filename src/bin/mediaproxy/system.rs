use anyhow::{anyhow, Result};
use media_proxy::db::{build_pool, run_migrations};
use media_proxy::{MediaCacheSettings, SweepSettings};

pub async fn handle_init() -> Result<()> {
    let settings = MediaCacheSettings::from_env();

    println!(
        "creating cache directory {}...",
        settings.cache_directory.display()
    );
    tokio::fs::create_dir_all(&settings.cache_directory).await?;
    println!("complete.");

    Ok(())
}

pub async fn handle_migrations() -> Result<()> {
    let database_url = SweepSettings::from_env()
        .database_url
        .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

    println!("running database migrations...");
    let pool = build_pool(&database_url)?;
    let applied = run_migrations(&pool).await?;
    println!("complete ({applied} applied).");

    Ok(())
}
