//! fossickd binary — thin CLI shell over the [`fossick_server`] library.

use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use fossick_core::config::Config;
use fossick_server::error::{EXIT_CONFIG, EXIT_MISSING_DEPENDENCY, EXIT_OK, EXIT_STORAGE};
use fossick_server::index::{EMAIL_INDEX_NAME, FILE_INDEX_NAME, UPDATE_INDEX_NAME};
use fossick_server::schedule::{RunExit, Scheduler};
use fossick_server::state::EngineState;
use fossick_server::{default_config_path, default_data_dir, index, nfs_lock};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Desktop search and metadata indexing daemon.
#[derive(Parser)]
#[command(name = "fossickd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (default: ~/.config/fossick/fossick.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache directory for indexes and stores
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run one full indexing pass and exit instead of daemonizing
    #[arg(long)]
    one_shot: bool,

    /// Skip the live filesystem watcher
    #[arg(long)]
    no_watch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check configuration and index integrity, then exit
    Doctor,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Doctor
// ---------------------------------------------------------------------------

fn run_doctor(config_path: &PathBuf, data_dir: &PathBuf) -> i32 {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "configuration does not parse");
            return EXIT_CONFIG;
        }
    };
    info!(path = %config_path.display(), "configuration ok");
    info!(
        roots = config.watches.watch_directory_roots.len(),
        language = config.indexing.language.as_str(),
        "watch roots configured"
    );

    let mut status = EXIT_OK;
    for name in [FILE_INDEX_NAME, EMAIL_INDEX_NAME, UPDATE_INDEX_NAME] {
        let path = data_dir.join(name);
        if !path.exists() {
            continue;
        }
        match index::IndexFile::check_integrity(&path) {
            Ok(records) => info!(index = name, records, "index ok"),
            Err(e) => {
                error!(index = name, error = %e, "index corrupt");
                status = EXIT_STORAGE;
            }
        }
    }
    status
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fossick=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    if let Some(command) = &cli.command {
        match command {
            Commands::Doctor => std::process::exit(run_doctor(&config_path, &data_dir)),
            Commands::Completions { shell } => {
                clap_complete::generate(*shell, &mut Cli::command(), "fossickd", &mut std::io::stdout());
                return;
            }
        }
    }

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "could not load configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(dir = %data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(EXIT_STORAGE);
    }

    let mut lock = nfs_lock::NfsLock::new(&data_dir, config.general.nfs_locking);
    if let Err(e) = lock.obtain() {
        error!(error = %e, "another indexer holds the lock");
        std::process::exit(EXIT_STORAGE);
    }

    let watching_wanted = config.watches.enable_watching && !cli.no_watch;
    let state = match EngineState::new(config, &data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "could not open stores");
            std::process::exit(EXIT_STORAGE);
        }
    };
    info!(data_dir = %data_dir.display(), "stores open");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("FOSSICK_STATUS={}", data_dir.join("status.json").display());

    let watcher = if watching_wanted {
        fossick_server::watch::start_watcher(Arc::clone(&state))
    } else {
        None
    };
    if watching_wanted && watcher.is_none() {
        error!("watching requested but no watch backend is available");
        std::process::exit(EXIT_MISSING_DEPENDENCY);
    }

    // The indexer thread owns the scheduler, caches and pipeline
    let indexer_state = Arc::clone(&state);
    let one_shot = cli.one_shot;
    let indexer = std::thread::Builder::new()
        .name("fossick-index".into())
        .spawn(move || {
            let mut scheduler = Scheduler::new(indexer_state);
            if one_shot {
                scheduler = scheduler.exit_when_idle();
            }
            scheduler.run()
        })
        .expect("spawning the indexer thread cannot fail");

    if one_shot {
        let exit = indexer.join().unwrap_or(RunExit::StorageError("indexer panicked".into()));
        drop(watcher);
        lock.release();
        std::process::exit(exit_code(exit));
    }

    shutdown_signal().await;
    state.request_shutdown();

    let exit = indexer.join().unwrap_or(RunExit::StorageError("indexer panicked".into()));
    drop(watcher);
    lock.release();
    std::process::exit(exit_code(exit));
}

fn exit_code(exit: RunExit) -> i32 {
    match exit {
        RunExit::Shutdown | RunExit::Idle => EXIT_OK,
        RunExit::StorageError(message) => {
            error!(error = %message, "indexer stopped on storage failure");
            EXIT_STORAGE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if ctrl_c.await.is_err() {
            tracing::warn!("could not listen for Ctrl+C");
        }
        info!("received Ctrl+C, shutting down");
    }
}
