//! SQLite-backed [`AppStore`] implementation.
//!
//! Maps each [`AppStore`] operation onto the `apps` and `app_versions`
//! tables created by [`crate::migrate`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use appgetter_core::models::{App, AppId, AppVersion, NewVersion, UserId};
use appgetter_core::store::AppStore;

/// SQLite implementation of the [`AppStore`] trait.
pub struct SqliteAppStore {
    pool: SqlitePool,
}

impl SqliteAppStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn row_to_version(row: &SqliteRow) -> Result<AppVersion> {
    Ok(AppVersion {
        app_id: row.try_get("app_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        schema: row.try_get::<i64, _>("schema")? as u32,
        api_version: row.try_get::<i64, _>("api")? as u32,
        location_key: row.try_get("location_key")?,
        created: ts_to_datetime(row.try_get("created")?),
    })
}

async fn insert_app(
    conn: &mut SqliteConnection,
    owner_id: UserId,
    name: &str,
    created: i64,
) -> Result<AppId> {
    sqlx::query_scalar(
        "INSERT INTO apps (owner_id, name, created) VALUES (?, ?, ?) RETURNING app_id",
    )
    .bind(owner_id)
    .bind(name)
    .bind(created)
    .fetch_one(conn)
    .await
    .context("Failed to insert app")
}

async fn insert_version(
    conn: &mut SqliteConnection,
    app_id: AppId,
    version: &NewVersion,
    created: i64,
) -> Result<AppVersion> {
    sqlx::query(
        r#"
        INSERT INTO app_versions (app_id, name, version, schema, api, location_key, created)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(app_id)
    .bind(&version.name)
    .bind(&version.version)
    .bind(version.schema as i64)
    .bind(version.api_version as i64)
    .bind(&version.location_key)
    .bind(created)
    .execute(conn)
    .await
    .with_context(|| {
        format!(
            "Failed to insert version {} for app {}",
            version.version, app_id
        )
    })?;

    Ok(AppVersion {
        app_id,
        name: version.name.clone(),
        version: version.version.clone(),
        schema: version.schema,
        api_version: version.api_version,
        location_key: version.location_key.clone(),
        created: ts_to_datetime(created),
    })
}

#[async_trait]
impl AppStore for SqliteAppStore {
    async fn create_app(&self, owner_id: UserId, name: &str) -> Result<App> {
        let created = Utc::now().timestamp();
        let mut conn = self.pool.acquire().await?;
        let app_id = insert_app(&mut conn, owner_id, name, created).await?;
        Ok(App {
            app_id,
            owner_id,
            name: name.to_string(),
            created: ts_to_datetime(created),
        })
    }

    async fn get_app(&self, app_id: AppId) -> Result<Option<App>> {
        let row = sqlx::query("SELECT app_id, owner_id, name, created FROM apps WHERE app_id = ?")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| -> Result<App> {
            Ok(App {
                app_id: r.try_get("app_id")?,
                owner_id: r.try_get("owner_id")?,
                name: r.try_get("name")?,
                created: ts_to_datetime(r.try_get("created")?),
            })
        })
        .transpose()
    }

    async fn create_version(&self, version: &NewVersion) -> Result<AppVersion> {
        let mut conn = self.pool.acquire().await?;
        insert_version(&mut conn, version.app_id, version, Utc::now().timestamp()).await
    }

    async fn create_app_with_version(
        &self,
        owner_id: UserId,
        version: &NewVersion,
    ) -> Result<(App, AppVersion)> {
        let created = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        let app_id = insert_app(&mut tx, owner_id, &version.name, created).await?;
        let row = insert_version(&mut tx, app_id, version, created).await?;
        tx.commit().await.context("Failed to commit new app")?;

        Ok((
            App {
                app_id,
                owner_id,
                name: version.name.clone(),
                created: ts_to_datetime(created),
            },
            row,
        ))
    }

    async fn list_versions(&self, app_id: AppId) -> Result<Vec<AppVersion>> {
        let rows = sqlx::query(
            r#"
            SELECT app_id, name, version, schema, api, location_key, created
            FROM app_versions WHERE app_id = ?
            ORDER BY created ASC
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_version).collect()
    }
}
