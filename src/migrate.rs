use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    create_tables(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the application tables. Idempotent.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS apps (
            app_id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            created INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_versions (
            app_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            schema INTEGER NOT NULL,
            api INTEGER NOT NULL,
            location_key TEXT NOT NULL,
            created INTEGER NOT NULL,
            UNIQUE(app_id, version),
            FOREIGN KEY (app_id) REFERENCES apps(app_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_app_versions_app_id ON app_versions(app_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_apps_owner_id ON apps(owner_id)")
        .execute(pool)
        .await?;

    Ok(())
}
