use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use conflux::{
    GracefulShutdown, HttpClientAdapter, ReloadSupervisor,
    admin::{AdminState, admin_router},
    adapters::repository::build_repository,
    config::{load_service_config, models::ServiceConfig},
    core::ProxyFactory,
    metrics, tracing_setup,
};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "conflux.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the service configuration and endpoint definitions
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
}

const STARTER_CONFIG: &str = r#"# Conflux service configuration
port: 8000
timeout: 2s
grace_timeout: 10s

# Default upstream hosts, inherited by backends that list none.
hosts: []

repository:
  # One YAML file per endpoint group under <dir>/apis/
  dsn: "file://."
  refresh_time: 30s

admin:
  port: 8001
  enabled: true
"#;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => validate_command(&config_path).await,
        "init" => init_command(&config_path),
        "serve" => serve_command(&config_path).await,
        _ => unreachable!(),
    }
}

async fn validate_command(config_path: &str) -> Result<()> {
    tracing_setup::init_console_tracing()?;

    let service = load_service_config(config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    let repository = build_repository(&service, None)
        .await
        .context("Failed to build the endpoint repository")?;
    let maps = repository.find_all().await?;
    let configuration = conflux::ports::repository::Configuration::new(maps);
    configuration.validate()?;

    println!(
        "Configuration OK: {} group(s), {} endpoint(s)",
        configuration.definition_maps.len(),
        configuration.all_definitions().count()
    );
    Ok(())
}

fn init_command(config_path: &str) -> Result<()> {
    if std::path::Path::new(config_path).exists() {
        return Err(eyre!("refusing to overwrite existing file {config_path}"));
    }
    std::fs::write(config_path, STARTER_CONFIG)
        .with_context(|| format!("Failed to write {config_path}"))?;
    println!("Wrote starter configuration to {config_path}");
    Ok(())
}

async fn serve_command(config_path: &str) -> Result<()> {
    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {e}"))?;
    metrics::init_metrics();

    tracing::info!(config = config_path, "loading service configuration");
    let service: ServiceConfig = load_service_config(config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;

    let repository = build_repository(&service, None)
        .await
        .context("Failed to build the endpoint repository")?;

    let executor = Arc::new(
        HttpClientAdapter::new(service.idle_connection_timeout)
            .context("Failed to create the upstream HTTP client")?,
    );
    let factory = Arc::new(ProxyFactory::new(executor));

    let (admin_tx, admin_rx) = mpsc::channel(64);
    let (stop_tx, stop_rx) = mpsc::channel(1);

    let (supervisor, dispatcher, view) =
        ReloadSupervisor::new(service.clone(), repository.clone(), factory, admin_rx, stop_rx)
            .await
            .context("Failed to build the initial route table")?;
    let supervisor_handle = tokio::spawn(supervisor.run());

    let shutdown = Arc::new(GracefulShutdown::new(service.grace_timeout));

    // Signal handler task
    let shutdown_for_signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_for_signals.run_signal_handler().await {
            tracing::error!(error = %e, "signal handler failed");
        }
    });

    // Gateway listener
    let gateway_addr = SocketAddr::from(([0, 0, 0, 0], service.port));
    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("Failed to bind gateway listener on {gateway_addr}"))?;
    tracing::info!(address = %gateway_addr, "gateway listening");

    let gateway_router = dispatcher.clone().into_router();
    let mut gateway_shutdown = shutdown.subscribe();
    let gateway_server = tokio::spawn(async move {
        axum::serve(
            gateway_listener,
            gateway_router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = gateway_shutdown.recv().await;
        })
        .await
    });

    // Admin listener. The sender stays alive either way so the supervisor's
    // admin branch never reports a closed channel.
    let mut admin_tx_keepalive = None;
    let admin_server = if service.admin.enabled {
        let admin_addr = SocketAddr::from(([0, 0, 0, 0], service.admin.port));
        let admin_listener = tokio::net::TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("Failed to bind admin listener on {admin_addr}"))?;
        tracing::info!(address = %admin_addr, "admin API listening");

        let admin_app = admin_router(AdminState::new(admin_tx, view));
        let mut admin_shutdown = shutdown.subscribe();
        Some(tokio::spawn(async move {
            axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move {
                    let _ = admin_shutdown.recv().await;
                })
                .await
        }))
    } else {
        admin_tx_keepalive = Some(admin_tx);
        None
    };

    // Wait for both listeners to drain after a shutdown signal.
    let gateway_result = gateway_server.await;
    if let Some(admin_server) = admin_server {
        let _ = admin_server.await;
    }

    tracing::info!(
        grace = ?shutdown.grace_timeout(),
        "listeners stopped, waiting for in-flight work"
    );
    tokio::time::sleep(shutdown.grace_timeout()).await;

    let _ = stop_tx.send(()).await;
    let _ = supervisor_handle.await;
    drop(admin_tx_keepalive);
    repository.close().ok();

    gateway_result
        .map_err(|e| eyre!("gateway server task failed: {e}"))?
        .map_err(|e| eyre!("gateway server error: {e}"))?;

    tracing::info!("conflux stopped");
    Ok(())
}
