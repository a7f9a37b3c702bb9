//! `appgetter check` and `appgetter install`: run the pipeline on a local
//! package from the command line.
//!
//! Both commands submit the package (a directory or a zip archive), print
//! progress to stderr while it is processed and print the results to
//! stdout. `check` always discards the package afterwards; `install`
//! commits it when it is clean.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

use appgetter_core::models::{AppId, UserId};

use crate::config::Config;
use crate::db;
use crate::getter::AppGetter;
use crate::keys::ProcessResults;
use crate::package::load_dir;
use crate::progress::ProgressMode;

/// Options shared by `check` and `install`.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub user_id: UserId,
    pub app_id: Option<AppId>,
    pub progress: ProgressMode,
    pub json: bool,
}

/// Process a package and discard it. Returns whether it was clean.
pub async fn run_check(config: &Config, path: &Path, opts: &CheckOptions) -> Result<bool> {
    let getter = AppGetter::from_config(config, db::connect(config).await?);
    let (token, results) = process(&getter, path, opts).await?;
    print_results(&results, opts.json)?;
    getter
        .delete(&token)
        .await
        .context("Failed to discard package")?;
    Ok(results.is_ok())
}

/// Process a package and commit it if it is clean. Returns whether it was
/// installed.
pub async fn run_install(config: &Config, path: &Path, opts: &CheckOptions) -> Result<bool> {
    let getter = AppGetter::from_config(config, db::connect(config).await?);
    let (token, results) = process(&getter, path, opts).await?;

    if !results.is_ok() {
        print_results(&results, opts.json)?;
        getter
            .delete(&token)
            .await
            .context("Failed to discard package")?;
        return Ok(false);
    }

    let (app_id, version) = commit_or_discard(&getter, &token).await?;
    if opts.json {
        println!(
            "{}",
            serde_json::json!({ "app_id": app_id, "version": version })
        );
    } else {
        for (key, warning) in &results.warnings {
            println!("warning: {}: {}", key, warning);
        }
        println!("Installed app {} version {}", app_id, version);
    }
    Ok(true)
}

/// Commit a processed session. If the commit fails the package is deleted,
/// so nothing is left behind that no version refers to.
pub async fn commit_or_discard(getter: &AppGetter, token: &str) -> Result<(AppId, String)> {
    match getter.commit(token).await {
        Ok(committed) => Ok(committed),
        Err(e) => {
            if let Err(cleanup) = getter.delete(token).await {
                warn!(token, error = %cleanup, "could not discard package after failed commit");
            }
            Err(anyhow::Error::new(e).context("Commit failed"))
        }
    }
}

async fn process(
    getter: &AppGetter,
    path: &Path,
    opts: &CheckOptions,
) -> Result<(String, ProcessResults)> {
    let max_bytes = getter.settings().max_package_bytes;
    let token = if path.is_dir() {
        let files = load_dir(path, max_bytes)
            .with_context(|| format!("Failed to read package {}", path.display()))?;
        getter.install_files(opts.user_id, &files, opts.app_id).await?
    } else if path.is_file() {
        let archive = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read archive {}", path.display()))?;
        getter
            .install_archive(opts.user_id, archive, opts.app_id)
            .await?
    } else {
        bail!("{} does not exist", path.display());
    };

    let reporter = opts.progress.reporter();
    getter
        .wait_done(&token, |event| reporter.report(event))
        .await
        .context("Processing session vanished")?;

    let results = getter
        .get_results(&token)
        .context("Processing finished without results")?;
    Ok((token, results))
}

fn print_results(results: &ProcessResults, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
        return Ok(());
    }

    if let Some(m) = &results.manifest {
        println!("{} {} (schema {}, api {})", m.name, m.version, m.schema, m.api_version);
    }
    if let Some(prev) = &results.prev_version {
        println!("previous version: {}", prev);
    }
    if let Some(next) = &results.next_version {
        println!("next version: {}", next);
    }
    for (key, warning) in &results.warnings {
        println!("warning: {}: {}", key, warning);
    }
    for error in &results.errors {
        println!("error: {}", error);
    }
    if results.is_ok() {
        println!("OK");
    }
    Ok(())
}
