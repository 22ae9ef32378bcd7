//! # proxtrace
//!
//! Command line front end for the proxtrace engine.
//!
//! This binary provides:
//! - the current beacon and own key history of an app
//! - diagnosis key bundle inspection and matching
//! - exposure result queries (sketch, details, windows)
//! - retention eviction and per-app wipes
//!
//! Results are printed to stdout as JSON; logs go to stderr.
//!
//! ## Running
//!
//! ```bash
//! proxtrace beacon --app org.example.tracer
//! proxtrace analyze --app org.example.tracer --token t1 export-1.zip export-2.zip
//! proxtrace details --app org.example.tracer --token t1
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxtrace_core::{
    default_config_path, AppId, ContactShield, DiagnosisConfiguration, DiagnosisKeyImporter,
    KeyBundle, ShieldRuntime, ShieldSettings, WINDOW_MODE_TOKEN,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

mod logging;

#[derive(Parser)]
#[command(name = "proxtrace")]
#[command(about = "Proximity tracing engine: beacons, diagnosis key matching and exposure results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML). Defaults to the platform config directory.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Write JSON logs to a rolling file
    #[arg(long, global = true)]
    production: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current 20-byte beacon of an app, hex encoded
    Beacon {
        /// App identity
        #[arg(short, long)]
        app: String,
    },

    /// Export the periodic keys an app has used
    Keys {
        /// App identity
        #[arg(short, long)]
        app: String,
    },

    /// Show what a set of diagnosis key bundles contains
    Inspect {
        /// Bundle files
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },

    /// Match diagnosis key bundles against recorded sightings
    Analyze {
        /// App identity
        #[arg(short, long)]
        app: String,

        /// Token grouping the results of this diagnosis
        #[arg(short, long, default_value = "default")]
        token: String,

        /// Record contact windows instead of a sketch
        #[arg(long, conflicts_with = "token")]
        windows: bool,

        /// Risk configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        risk_config: Option<PathBuf>,

        /// Bundle files
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },

    /// Print the sketch recorded for a token
    Sketch {
        /// App identity
        #[arg(short, long)]
        app: String,

        /// Diagnosis token
        #[arg(short, long)]
        token: String,
    },

    /// Print the contact details recorded for a token
    Details {
        /// App identity
        #[arg(short, long)]
        app: String,

        /// Diagnosis token
        #[arg(short, long)]
        token: String,
    },

    /// Print the contact windows recorded for an app
    Windows {
        /// App identity
        #[arg(short, long)]
        app: String,
    },

    /// Drop sightings, keys and results past their retention
    Evict {
        /// App identity
        #[arg(short, long)]
        app: String,
    },

    /// Delete every record of an app
    Wipe {
        /// App identity
        #[arg(short, long)]
        app: String,
    },

    /// Write the effective settings to a TOML file
    InitConfig {
        /// Target file. Defaults to the platform config path.
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.production)?;

    let settings = load_settings(cli.config.as_deref(), cli.data_dir)?;
    info!(command = command_name(&cli.command), "starting proxtrace");

    match cli.command {
        Commands::InitConfig { path } => {
            let path = match path {
                Some(path) => path,
                None => default_config_path()?,
            };
            settings.save(&path)?;
            print_json(&json!({ "written": path }))
        }
        Commands::Inspect { bundles } => inspect(&bundles),
        command => run(command, settings).await,
    }
}

async fn run(command: Commands, settings: ShieldSettings) -> Result<()> {
    let shield = Arc::new(ContactShield::open(settings)?);
    let runtime = ShieldRuntime::spawn(shield, proxtrace_core::executor::DEFAULT_WORKERS);

    match command {
        Commands::Beacon { app } => {
            let beacon = runtime.current_beacon(parse_app(&app)?).await?;
            print_json(&json!({ "app": app, "beacon": hex::encode(beacon) }))
        }
        Commands::Keys { app } => print_json(&runtime.history_keys(parse_app(&app)?).await?),
        Commands::Analyze {
            app,
            token,
            windows,
            risk_config,
            bundles,
        } => {
            let config = match risk_config {
                Some(path) => load_risk_config(&path)?,
                None => DiagnosisConfiguration::default(),
            };
            let token = if windows {
                WINDOW_MODE_TOKEN.to_string()
            } else {
                token
            };
            let bundles = bundles.into_iter().map(KeyBundle::from_path).collect();
            let updated = runtime
                .analyze(bundles, config, token.clone(), parse_app(&app)?)
                .await?;
            print_json(&json!({ "app": app, "token": token, "updated": updated }))
        }
        Commands::Sketch { app, token } => {
            print_json(&runtime.sketch(parse_app(&app)?, token).await?)
        }
        Commands::Details { app, token } => {
            print_json(&runtime.details(parse_app(&app)?, token).await?)
        }
        Commands::Windows { app } => print_json(&runtime.windows(parse_app(&app)?).await?),
        Commands::Evict { app } => {
            runtime.evict_expired(parse_app(&app)?).await?;
            print_json(&json!({ "app": app, "evicted": true }))
        }
        Commands::Wipe { app } => {
            runtime.delete_by_app(parse_app(&app)?).await?;
            print_json(&json!({ "app": app, "deleted": true }))
        }
        Commands::Inspect { .. } | Commands::InitConfig { .. } => Ok(()),
    }
}

fn inspect(paths: &[PathBuf]) -> Result<()> {
    let importer = DiagnosisKeyImporter::new();
    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        let bundle = KeyBundle::from_path(path);
        match importer.parse(&bundle) {
            Ok(imported) => reports.push(json!({
                "bundle": path,
                "header": imported.header,
                "region": imported.region,
                "start_timestamp": imported.start_timestamp,
                "end_timestamp": imported.end_timestamp,
                "batch_num": imported.batch_num,
                "batch_size": imported.batch_size,
                "signatures": imported.signature_count,
                "keys": imported.keys.len(),
                "rejected": imported.rejected,
            })),
            Err(e) => {
                warn!(bundle = %path.display(), error = %e, "cannot read bundle");
                reports.push(json!({ "bundle": path, "error": e.to_string() }));
            }
        }
    }
    print_json(&reports)
}

fn load_settings(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<ShieldSettings> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().ok(),
    };
    let mut settings = ShieldSettings::load(path.as_deref()).context("loading settings")?;
    if data_dir.is_some() {
        settings.data_dir = data_dir;
    }
    Ok(settings)
}

fn load_risk_config(path: &Path) -> Result<DiagnosisConfiguration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading risk configuration {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing risk configuration {}", path.display()))
}

fn parse_app(value: &str) -> Result<AppId> {
    Ok(AppId::new(value)?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

const fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Beacon { .. } => "beacon",
        Commands::Keys { .. } => "keys",
        Commands::Inspect { .. } => "inspect",
        Commands::Analyze { .. } => "analyze",
        Commands::Sketch { .. } => "sketch",
        Commands::Details { .. } => "details",
        Commands::Windows { .. } => "windows",
        Commands::Evict { .. } => "evict",
        Commands::Wipe { .. } => "wipe",
        Commands::InitConfig { .. } => "init-config",
    }
}
