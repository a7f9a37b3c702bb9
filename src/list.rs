//! `appgetter versions <app-id>`: list the stored versions of an app.

use anyhow::{bail, Result};

use appgetter_core::models::AppId;
use appgetter_core::store::AppStore;
use appgetter_core::versions::sort_versions;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteAppStore;

pub async fn run_versions(config: &Config, app_id: AppId) -> Result<()> {
    let store = SqliteAppStore::new(db::connect(config).await?);
    let Some(app) = store.get_app(app_id).await? else {
        bail!("no app with id {}", app_id);
    };

    let mut versions = store.list_versions(app_id).await?;
    sort_versions(&mut versions);

    println!("{} (app {}, owner {})", app.name, app.app_id, app.owner_id);
    if versions.is_empty() {
        println!("  no versions");
    }
    for v in &versions {
        println!(
            "  {:<12} schema {:<3} api {:<3} {}  {}",
            v.version,
            v.schema,
            v.api_version,
            v.created.format("%Y-%m-%d %H:%M"),
            v.location_key
        );
    }
    Ok(())
}
