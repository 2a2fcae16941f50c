use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use spalloc_core::{Controller, ControllerConfig, DEFAULT_RETRY_DELAY, LoggingConnector};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::{Configuration, load_config};
use crate::server::client::handle_client_connections;
use crate::server::state::ServerState;
use crate::server::state_file::{read_state_file, state_file_path, write_state_file};

pub struct ServerOptions {
    pub config_path: PathBuf,
    /// Ignore any saved state.
    pub cold_start: bool,
    pub port: Option<u16>,
    pub ip: Option<String>,
}

impl ServerOptions {
    fn load_config(&self) -> crate::Result<Configuration> {
        let mut config = load_config(&self.config_path)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ip) = &self.ip {
            config.ip = ip.clone();
        }
        Ok(config)
    }
}

/// Runs the server until SIGINT or SIGTERM, then saves the controller state.
pub async fn run_server(options: ServerOptions) -> anyhow::Result<()> {
    let mut config = options
        .load_config()
        .with_context(|| format!("Cannot load {}", options.config_path.display()))?;
    let state_path = state_file_path(&options.config_path);

    let controller = create_controller(&config, &state_path, options.cold_start);
    apply_configuration(&controller, &config)
        .await
        .context("Cannot apply configuration")?;

    let state = ServerState::new(controller.clone());
    tokio::spawn(state.clone().forward_changes());
    let mut listener = start_listener(&config, state.clone()).await?;
    let mut reaper = reaper_interval(config.timeout_check_interval);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = reaper.tick() => {
                controller.destroy_timed_out_jobs();
                controller.check_free();
            }
            _ = hangup.recv() => {
                log::info!("Received SIGHUP, reloading configuration");
                let new_config = match options.load_config() {
                    Ok(new_config) => new_config,
                    Err(error) => {
                        log::error!("Cannot reload configuration, keeping the old one: {error}");
                        continue;
                    }
                };
                if let Err(error) = apply_configuration(&controller, &new_config).await {
                    log::error!("Cannot apply configuration: {error}");
                    continue;
                }
                if new_config.bind_address() != config.bind_address() {
                    match start_listener(&new_config, state.clone()).await {
                        Ok(new_listener) => {
                            listener.abort();
                            listener = new_listener;
                        }
                        Err(error) => log::error!("{error:#}"),
                    }
                }
                if new_config.timeout_check_interval != config.timeout_check_interval {
                    reaper = reaper_interval(new_config.timeout_check_interval);
                }
                config = new_config;
            }
            _ = interrupt.recv() => {
                log::info!("Received SIGINT, stopping");
                break;
            }
            _ = terminate.recv() => {
                log::info!("Received SIGTERM, stopping");
                break;
            }
        }
    }

    listener.abort();
    let stopping = controller.clone();
    tokio::task::spawn_blocking(move || {
        stopping.stop();
        stopping.join();
    })
    .await?;
    write_state_file(&state_path, &controller.snapshot())
        .with_context(|| format!("Cannot write state to {}", state_path.display()))?;
    log::info!("State saved to {}", state_path.display());
    Ok(())
}

/// Restores the controller from the state file unless a cold start was
/// requested or the file cannot be used.
pub(crate) fn create_controller(
    config: &Configuration,
    state_path: &Path,
    cold_start: bool,
) -> Controller {
    let connector = Arc::new(LoggingConnector);
    if !cold_start {
        match read_state_file(state_path) {
            Ok(Some(snapshot)) => {
                match Controller::restore(snapshot, connector.clone(), DEFAULT_RETRY_DELAY) {
                    Ok(controller) => {
                        let saved_at = std::fs::metadata(state_path)
                            .and_then(|metadata| metadata.modified())
                            .map(|time| DateTime::<Local>::from(time).to_rfc2822())
                            .unwrap_or_else(|_| "unknown time".to_string());
                        log::info!(
                            "Restored state saved at {saved_at} from {}",
                            state_path.display()
                        );
                        return controller;
                    }
                    Err(error) => {
                        log::warn!("Cannot restore saved state, starting from scratch: {error}")
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                log::warn!("Cannot read saved state, starting from scratch: {error}")
            }
        }
    }
    Controller::new(
        ControllerConfig {
            max_retired_jobs: config.max_retired_jobs,
            seconds_before_free: config.seconds_before_free,
            bmp_retry_delay: DEFAULT_RETRY_DELAY,
        },
        connector,
    )
}

/// Applies settings and machines of a configuration to a running
/// controller. Replacing machines may wait for BMP workers to finish, so it
/// runs on the blocking pool.
pub(crate) async fn apply_configuration(
    controller: &Controller,
    config: &Configuration,
) -> crate::Result<()> {
    let controller = controller.clone();
    let max_retired_jobs = config.max_retired_jobs;
    let seconds_before_free = config.seconds_before_free;
    let machines = config.machines.clone();
    tokio::task::spawn_blocking(move || {
        controller.set_max_retired_jobs(max_retired_jobs);
        controller.set_seconds_before_free(seconds_before_free);
        controller.set_machines(machines)
    })
    .await
    .map_err(|error| crate::Error::GenericError(error.to_string()))??;
    Ok(())
}

async fn start_listener(
    config: &Configuration,
    state: ServerState,
) -> anyhow::Result<JoinHandle<()>> {
    let address = config.bind_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Cannot listen on {address}"))?;
    log::info!("Listening on {}", listener.local_addr()?);
    Ok(tokio::spawn(handle_client_connections(listener, state)))
}

fn reaper_interval(seconds: f64) -> Interval {
    let mut interval = tokio::time::interval(Duration::from_secs_f64(seconds));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
