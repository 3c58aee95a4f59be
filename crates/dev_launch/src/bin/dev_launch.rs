//! dev_launch CLI
//!
//! Usage:
//!   dev_launch
//!   dev_launch --emulator
//!   dev_launch -C web --port 3000 --reap 3000-3002 --no-browser

use dev_launch::{LaunchArgs, LaunchConfig, LaunchOptions, Orchestrator};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    let project_root = match args.project_root.clone() {
        Some(root) => root,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                log::error!("Failed to get current directory: {}", e);
                std::process::exit(1);
            }
        },
    };

    let mut config = match LaunchConfig::load(&project_root, args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    args.apply_to(&mut config);

    let options = LaunchOptions {
        emulator: args.emulator,
    };
    let mut orchestrator = match Orchestrator::new(config, options) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            log::error!("{}", e);
            if let Some(fix) = e.remediation() {
                log::error!("{}", fix);
            }
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Ctrl+C and SIGTERM both trigger a graceful shutdown
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, stopping...");
        let _ = shutdown_tx.send(());
    }) {
        log::warn!("Could not install signal handler: {}", e);
    }

    match orchestrator.run(shutdown_rx).await {
        Ok(outcome) => {
            log::info!("dev_launch exiting");
            std::process::exit(outcome.exit_code);
        }
        Err(e) => {
            log::error!("{}", e);
            if let Some(fix) = e.remediation() {
                log::error!("{}", fix);
            }
            std::process::exit(1);
        }
    }
}
