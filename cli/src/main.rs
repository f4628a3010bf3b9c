use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rl_core::cli::Cli;
use rl_core::trainers::learn::get_version_string;
use rl_core::utils::CancellationToken;
use rl_core::{run_training, TrainingError};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(reason) = cli.validate() {
        error!("{reason}");
        std::process::exit(2);
    }

    match run(cli) {
        Ok(()) => {}
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("{}", get_version_string());
    let options = cli
        .into_run_options()
        .context("failed to load the run configuration")?;

    let interrupt = CancellationToken::new();
    spawn_shutdown_listener(interrupt.clone());

    match run_training(&options, &interrupt) {
        Ok(summary) => {
            info!(
                global_step = summary.global_step,
                checkpoints = summary.checkpoint_steps.len(),
                exported = summary.exported,
                interrupted = summary.interrupted,
                "training finished"
            );
            Ok(())
        }
        Err(err @ TrainingError::ExistingRun(_)) => Err(err.into()),
        Err(err) => Err(err).context("training failed"),
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .with_thread_ids(false)
        .compact()
        .init();
}

/// Cancels `interrupt` on Ctrl+C or SIGTERM. Runs on its own thread so the
/// training loop stays synchronous.
fn spawn_shutdown_listener(interrupt: CancellationToken) {
    let spawned = std::thread::Builder::new()
        .name("shutdown-listener".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Failed to build signal runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(shutdown_signal());
            info!("interrupt received, stopping after the current step");
            interrupt.cancel();
        });
    if let Err(e) = spawned {
        warn!("Failed to spawn shutdown listener: {}", e);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
