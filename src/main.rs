//! # AppGetter CLI (`appgetter`)
//!
//! ## Usage
//!
//! ```bash
//! appgetter --config ./config/appgetter.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `appgetter init` | Create the SQLite database and run schema migrations |
//! | `appgetter check <path>` | Validate a package directory or zip, then discard it |
//! | `appgetter install <path>` | Validate a package and commit it as an app version |
//! | `appgetter versions <app-id>` | List the stored versions of an app |
//! | `appgetter serve` | Start the HTTP API |
//!
//! Exit status is 1 when `check` or `install` finds problems with the package.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use appgetter::check::{run_check, run_install, CheckOptions};
use appgetter::config;
use appgetter::db;
use appgetter::getter::AppGetter;
use appgetter::list::run_versions;
use appgetter::migrate;
use appgetter::progress::ProgressMode;
use appgetter::server;

/// AppGetter: ingestion and validation of sandboxed appspace applications.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "appgetter", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/appgetter.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run more than once.
    Init,

    /// Validate a package and discard it.
    ///
    /// Runs the full pipeline (metadata, version sequence, route discovery)
    /// on a package directory or zip archive and prints the results.
    Check {
        /// Package directory or `.zip` archive.
        path: PathBuf,
        #[command(flatten)]
        args: PackageArgs,
    },

    /// Validate a package and commit it as a new app version.
    Install {
        /// Package directory or `.zip` archive.
        path: PathBuf,
        #[command(flatten)]
        args: PackageArgs,
    },

    /// List the versions stored for an app.
    Versions {
        app_id: i64,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(clap::Args)]
struct PackageArgs {
    /// Existing app this package is a new version of.
    #[arg(long)]
    app_id: Option<i64>,

    /// Owning user.
    #[arg(long, default_value_t = 1)]
    user: i64,

    /// Progress output on stderr. Defaults to `human` on a terminal.
    #[arg(long, value_enum)]
    progress: Option<ProgressArg>,

    /// Print results as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl PackageArgs {
    fn options(&self) -> CheckOptions {
        let progress = match self.progress {
            Some(ProgressArg::Off) => ProgressMode::Off,
            Some(ProgressArg::Human) => ProgressMode::Human,
            Some(ProgressArg::Json) => ProgressMode::Json,
            None => ProgressMode::default_for_tty(),
        };
        CheckOptions {
            user_id: self.user,
            app_id: self.app_id,
            progress,
            json: self.json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.storage.root)?;
            println!("Database initialized successfully.");
        }
        Commands::Check { path, args } => {
            if !run_check(&cfg, &path, &args.options()).await? {
                std::process::exit(1);
            }
        }
        Commands::Install { path, args } => {
            if !run_install(&cfg, &path, &args.options()).await? {
                std::process::exit(1);
            }
        }
        Commands::Versions { app_id } => {
            run_versions(&cfg, app_id).await?;
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::create_tables(&pool).await?;
            let getter = AppGetter::from_config(&cfg, pool);
            server::run_server(&cfg.server.bind, getter).await?;
        }
    }

    Ok(())
}
