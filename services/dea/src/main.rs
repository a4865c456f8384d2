//! Droplet Execution Agent
//!
//! Runs application instances on this node on behalf of the platform.
//!
//! - **Bus**: all requests arrive on, and all state leaves through, the
//!   message bus; losing it is fatal
//! - **Recovery**: instances of the previous run are reloaded from the
//!   snapshot and reconciled with the process table before traffic is handled
//! - **Signals**: SIGINT/SIGTERM shut down, SIGUSR2 evacuates and shuts down
//!   after the evacuation delay

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dea_agent::{
    component::Component,
    config::Config,
    launcher::ProcessLauncher,
    monitor::ProcTable,
    net,
    resources::HostResources,
    staging::{DropletStager, HttpBitsSource},
    tasks, Agent, Collaborators, Endpoint,
};
use dea_bus::ConnectOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout of a single droplet download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "dea", version, about = "Droplet execution agent")]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, env = "DEA_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    info!(
        base_dir = %config.base_dir.display(),
        bus_uri = %config.bus_uri,
        max_memory = config.max_memory,
        secure = config.secure,
        "Configuration loaded"
    );

    let options = ConnectOptions::from_uri(&config.bus_uri).context("Invalid bus URI")?;
    let host = match &config.local_ip {
        Some(ip) => ip.clone(),
        None => net::local_ip(&options.host)
            .context("Failed to detect the local IP")?
            .to_string(),
    };

    // Status endpoint
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.status_port))
        .await
        .context("Failed to bind the status port")?;
    let status_port = listener.local_addr()?.port();
    let file_port = match config.file_viewer_port {
        0 => net::grab_ephemeral_port().context("Failed to allocate the file viewer port")?,
        port => port,
    };
    let component = Arc::new(Component::new(
        "DEA",
        config.index,
        format!("{host}:{status_port}"),
        HostResources::measure().cores,
    ));

    // Bus client; errors it reports are fatal
    let client = dea_bus::Client::new(options);
    let (error_tx, mut error_rx) = mpsc::unbounded_channel();
    client.on_error(move |e| {
        let _ = error_tx.send(e.to_string());
    });

    let collaborators = Collaborators {
        publisher: Arc::new(client.clone()),
        stager: Arc::new(DropletStager::new(
            config.staged_dir(),
            config.shared_dir.clone(),
            config.disable_dir_cleanup,
            Arc::new(HttpBitsSource::new(DOWNLOAD_TIMEOUT)?),
        )),
        launcher: Arc::new(ProcessLauncher::new(Duration::from_secs(
            config.intervals.stop_grace_secs,
        ))),
        processes: Arc::new(ProcTable::new()),
    };
    let evacuation_delay = Duration::from_secs(config.intervals.evacuation_delay_secs);
    let agent = Agent::new(
        config,
        Endpoint { host, file_port },
        Arc::clone(&component),
        collaborators,
    );

    agent.recover()?;
    client.connect().await.context("Failed to connect to the bus")?;
    info!(uuid = %agent.uuid(), "Connected to the bus");

    component.register(&client);
    tokio::spawn({
        let component = Arc::clone(&component);
        async move {
            if let Err(e) = component.serve(listener).await {
                error!(error = %e, "Status endpoint failed");
            }
        }
    });

    agent.subscribe(&client);
    agent.startup().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = tasks::spawn_all(&agent, shutdown_rx);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            None
        }
        _ = sigusr2.recv() => {
            info!(delay_secs = evacuation_delay.as_secs(), "Received SIGUSR2, evacuating");
            agent.evacuate();
            tokio::time::sleep(evacuation_delay).await;
            None
        }
        Some(e) = error_rx.recv() => Some(e),
    };

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Periodic task panicked");
        }
    }

    if let Some(e) = fatal {
        error!(error = %e, "Fatal bus error");
        if agent.recovered() {
            if let Err(e) = agent.snapshots().snapshot_now().await {
                error!(error = %e, "Failed to write snapshot");
            }
        }
        client.close();
        return Err(anyhow!("Fatal bus error: {e}"));
    }

    agent.shutdown().await;
    client.close();
    info!("Agent shutdown complete");
    Ok(())
}
