//! CLI entry point for the hwtranscode engine
//!
//! `serve` runs the job engine behind the HTTP API, `detect` prints the host's
//! hardware capabilities and `transcode` runs a single file through the engine.

use clap::{Parser, Subcommand};
use hwtranscode::config::ConfigError;
use hwtranscode::{
    default_bind_addr, run_server, run_startup_checks, CapabilityDetector, Config,
    DirectoryCatalog, Engine, JobStatus, StaticCatalog,
};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Hardware-aware transcoding daemon
#[derive(Parser, Debug)]
#[command(name = "hwtranscoded")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan media directories and serve the job API
    Serve {
        /// Path to the configuration file (config.toml)
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Address to serve the API on
        #[arg(short, long, default_value_t = default_bind_addr())]
        bind: SocketAddr,

        /// Media library directory, in addition to the configured ones
        #[arg(short, long = "media-dir")]
        media_dir: Vec<PathBuf>,

        /// Skip startup checks (encoder and prober). For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
    /// Print detected hardware acceleration as JSON
    Detect {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Transcode one file and exit
    Transcode {
        /// Source media file
        file: PathBuf,

        /// Preset name
        #[arg(short, long, default_value = "medium")]
        preset: String,

        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output directory, overriding the configured transcode path
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if path.exists() {
        info!("Config file: {}", path.display());
        Config::load(path)
    } else {
        warn!("Config file {} not found, using defaults", path.display());
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

async fn serve(
    config: Config,
    bind: SocketAddr,
    media_dirs: Vec<PathBuf>,
    skip_checks: bool,
) -> ExitCode {
    if skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else if let Err(e) = run_startup_checks(&config) {
        error!("Startup check failed: {}", e);
        return ExitCode::FAILURE;
    }

    let mut roots = config.engine.media_paths.clone();
    roots.extend(media_dirs);
    let roots: Vec<PathBuf> = roots
        .iter()
        .map(|root| config.path_mappings.apply(root))
        .collect();
    for root in &roots {
        if !root.exists() {
            warn!("Media directory does not exist: {}", root.display());
        }
    }
    let root_count = roots.len();
    let catalog = match tokio::task::spawn_blocking(move || DirectoryCatalog::scan(&roots)).await {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Media scan failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Catalog: {} media item(s) in {} director(ies)",
        catalog.len(),
        root_count
    );

    let capabilities = CapabilityDetector::new(&config.engine.encoder_path)
        .detect()
        .await;
    match &capabilities.recommended {
        Some(accel) => info!("Hardware acceleration: {:?}", accel),
        None => info!("No hardware acceleration detected, encoding in software"),
    }

    let engine = Engine::new(config, Arc::new(catalog), capabilities);
    info!(
        "Engine ready, {} max concurrent job(s)",
        engine.max_concurrent_jobs().await
    );

    if let Err(e) = run_server(engine, bind).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn detect(config: Config) -> ExitCode {
    let snapshot = CapabilityDetector::new(&config.engine.encoder_path)
        .detect()
        .await;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to serialize capabilities: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn transcode(
    mut config: Config,
    file: PathBuf,
    preset: String,
    output_dir: Option<PathBuf>,
) -> ExitCode {
    if let Some(dir) = output_dir {
        config.engine.transcode_path = dir;
    }
    let file = std::fs::canonicalize(&file).unwrap_or(file);
    let (catalog, media_id) = StaticCatalog::single_file(&file);

    let capabilities = CapabilityDetector::new(&config.engine.encoder_path)
        .detect()
        .await;
    let engine = Engine::new(config, Arc::new(catalog), capabilities);
    let mut events = engine.subscribe();

    let job_id = match engine.submit(&media_id, &preset).await {
        Ok(id) => id,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    info!("Job {}: transcoding {}", job_id, file.display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling job {}", job_id);
                engine.cancel(&job_id).await;
            }
            event = events.recv() => match event {
                Ok(event) if event.job_id == job_id => {
                    if event.status.is_terminal() {
                        break;
                    }
                    if event.status == JobStatus::Processing {
                        info!(
                            "Job {}: {:.1}% ({:.1}s{}){}",
                            job_id,
                            event.progress * 100.0,
                            event.current_time,
                            event.duration.map(|d| format!(" of {:.1}s", d)).unwrap_or_default(),
                            event.output_size.map(|s| format!(", {}", s)).unwrap_or_default(),
                        );
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    // The terminal event may have been dropped
                    let done = engine.get_status(&job_id).await.map_or(true, |j| j.is_terminal());
                    if done {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let Some(job) = engine.get_status(&job_id).await else {
        error!("Job {} disappeared", job_id);
        return ExitCode::FAILURE;
    };
    match job.status {
        JobStatus::Completed => {
            let output = job
                .output_path
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            info!(
                "Job {}: completed in {} tier, {} ({})",
                job_id,
                job.tier.map(|t| t.to_string()).unwrap_or_default(),
                output,
                job.output_size.unwrap_or_default()
            );
            println!("{}", output);
            ExitCode::SUCCESS
        }
        JobStatus::Cancelled => {
            warn!("Job {}: cancelled", job_id);
            ExitCode::FAILURE
        }
        status => {
            error!(
                "Job {}: {}: {}",
                job_id,
                status,
                job.error_message.unwrap_or_default()
            );
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let args = Args::parse();
    let config_path = match &args.command {
        Command::Serve { config, .. }
        | Command::Detect { config }
        | Command::Transcode { config, .. } => config.clone(),
    };
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.command {
        Command::Serve {
            bind,
            media_dir,
            skip_checks,
            ..
        } => serve(config, bind, media_dir, skip_checks).await,
        Command::Detect { .. } => detect(config).await,
        Command::Transcode {
            file,
            preset,
            output_dir,
            ..
        } => transcode(config, file, preset, output_dir).await,
    }
}
