//! Command-line front end for the component manager.
//!
//! One-shot subcommands talk to the repository directly; `daemon` runs the
//! update controller until interrupted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use component_updater::{ComponentManager, UpdaterConfig, Version};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use update_controller::{ComponentStatus, UpdateController};

/// Install and update components published in a static repository.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Repository base URL (directory holding repository.json)
    #[arg(long)]
    base_url: Option<String>,

    /// Directory the host loads components from
    #[arg(long)]
    components_dir: Option<PathBuf>,

    /// Version of the host application
    #[arg(long)]
    host_version: Option<Version>,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the components the repository publishes
    ListComponents,

    /// List versions of a component compatible with this host
    ListVersions {
        component: String,

        /// Include alpha, beta and rc releases
        #[arg(long, default_value_t = false)]
        unstable: bool,
    },

    /// Install a component, by default its latest allowed version
    Install {
        component: String,

        #[arg(long)]
        version: Option<Version>,
    },

    /// Resolve every listed component against what is installed
    Status,

    /// Print a component's changelog
    ReleaseNotes { component: String },

    /// Poll the repository and keep statuses current until Ctrl+C
    Daemon,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "debug,component_updater=debug,update_controller=debug"
    } else {
        "info,component_updater=info,update_controller=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;
    let manager = ComponentManager::new(config).context("invalid configuration")?;

    match args.command {
        Commands::ListComponents => {
            for (id, name) in manager.list_components().await? {
                println!("{id}\t{name}");
            }
        }
        Commands::ListVersions {
            component,
            unstable,
        } => {
            for version in manager.list_versions(&component, unstable).await? {
                println!("{version}");
            }
        }
        Commands::Install { component, version } => {
            let installed = manager
                .install(&component, version)
                .await
                .with_context(|| format!("installing {component}"))?;
            println!(
                "installed {} {} into {}",
                installed.component_id,
                installed.version,
                installed.path.display()
            );
            println!("restart the host to load the new version");
        }
        Commands::Status => {
            let mut report = BTreeMap::new();
            for id in manager.list_components().await?.into_keys() {
                match manager.resolve(&id).await {
                    Ok(resolution) => {
                        report.insert(id, serde_json::to_value(resolution)?);
                    }
                    Err(err) => {
                        warn!(component = %id, error = %err, "cannot resolve component");
                        report.insert(id, serde_json::json!({ "error": err.to_string() }));
                    }
                }
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ReleaseNotes { component } => match manager.release_notes(&component).await {
            Some(notes) => println!("{notes}"),
            None => println!("no release notes published for {component}"),
        },
        Commands::Daemon => run_daemon(Arc::new(manager)).await?,
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<UpdaterConfig> {
    let mut config = match &args.config {
        Some(path) => UpdaterConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => UpdaterConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config = config.base_url(base_url.clone());
    }
    if let Some(dir) = &args.components_dir {
        config = config.components_dir(dir.clone());
    }
    if let Some(version) = &args.host_version {
        config = config.host_version(version.clone());
    }
    Ok(config)
}

async fn run_daemon(manager: Arc<ComponentManager>) -> anyhow::Result<()> {
    let controller = UpdateController::launch(manager);
    let handle = controller.handle();
    let mut updates = handle.subscribe();
    let mut seen: BTreeMap<String, ComponentStatus> = BTreeMap::new();

    // The timer only fires after a full interval.
    if let Err(err) = handle.refresh().await {
        warn!(error = %err, "initial repository poll failed");
    }

    info!("component manager running. Press Ctrl+C to exit.");
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = updates.borrow_and_update().clone();
                for (id, component) in &status.components {
                    if seen.get(id) == Some(component) {
                        continue;
                    }
                    info!(
                        component = %id,
                        state = ?component.state,
                        installed = ?component.installed.as_ref().map(ToString::to_string),
                        latest = ?component.latest.as_ref().map(ToString::to_string),
                        restart_required = component.restart_required,
                        error = ?component.last_error,
                        "component status"
                    );
                }
                seen = status.components;
            }
        }
    }

    info!("shutting down...");
    controller.shutdown().await?;
    Ok(())
}
