use {clap::Subcommand, pollcast_config::PollcastConfig, sqlx::sqlite::SqlitePoolOptions};

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
}

pub async fn handle_db(action: DbAction, config: &PollcastConfig) -> anyhow::Result<()> {
    match action {
        DbAction::Migrate => run_migrations(&config.database.url).await,
    }
}

/// Run all pending database migrations.
async fn run_migrations(database_url: &str) -> anyhow::Result<()> {
    println!("Running migrations for {database_url}...");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    pollcast_polls::run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("poll store migrations failed: {e}"))?;
    pool.close().await;
    println!("All migrations complete.");
    Ok(())
}
