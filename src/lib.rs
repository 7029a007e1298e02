pub mod channels; // Inter-component communication channels
pub mod config; // Configuration management
pub mod coordinator; // Reading dispatch and device registry
pub mod ecu; // ECU protocol, listeners and forwarding
pub mod error; // Error types
pub mod home_assistant; // Home Assistant discovery
pub mod mqtt; // MQTT client and messaging
pub mod options; // Command line options parsing
pub mod prelude; // Common imports and types

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::ecu::connection::ConnectionHandler;
use crate::ecu::forwarder::{Forward, UpstreamForwarder};
use crate::ecu::listener::ListenerSet;
use crate::mqtt::Mqtt;
use crate::prelude::*;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Everything started by [`app`], so it can be stopped in order.
pub struct Components {
    pub listeners: Arc<ListenerSet>,
    pub coordinator: Coordinator,
    pub mqtt: Mqtt,
    pub stats: Arc<Mutex<ProxyStats>>,
    handles: Vec<JoinHandle<()>>,
}

impl Components {
    /// Builds and starts every component from `config`. Readers are spawned
    /// before the listeners bind.
    pub async fn start(config: ConfigWrapper, no_forward: bool) -> Result<Self> {
        info!("Initializing channels...");
        let channels = Channels::new();
        let stats = Arc::new(Mutex::new(ProxyStats::default()));

        info!("Initializing components...");

        info!("  Creating Coordinator...");
        let coordinator = Coordinator::new(config.clone(), channels.clone(), stats.clone());
        let coordinator_clone = coordinator.clone();
        let coordinator_handle = tokio::spawn(async move {
            if let Err(e) = coordinator_clone.start().await {
                error!("Coordinator task failed: {}", e);
            }
        });

        info!("  Creating MQTT client...");
        let mqtt = Mqtt::new(config.clone(), channels.clone(), stats.clone());
        let mqtt_clone = mqtt.clone();
        let mqtt_handle = tokio::spawn(async move {
            if let Err(e) = mqtt_clone.start().await {
                error!("MQTT task failed: {}", e);
            }
        });

        // give both readers a chance to subscribe before the ports open
        tokio::task::yield_now().await;

        info!("  Creating decoder...");
        let catalog = Arc::new(ModelCatalog::new());
        let decoder = MessageDecoder::new(catalog).with_max_age(config.decoder().max_age());

        let upstream = config.upstream();
        let forwarder: Option<Arc<dyn Forward>> = if no_forward {
            info!("  Forwarding disabled on the command line");
            None
        } else if !upstream.enabled() {
            info!("  Forwarding disabled in config");
            None
        } else {
            info!("  Forwarding to {}", upstream.host());
            Some(Arc::new(UpstreamForwarder::from_config(&upstream)))
        };

        let listener = config.listener();
        let handler = ConnectionHandler::new(decoder, forwarder, channels, stats.clone())
            .with_read_timeout(listener.read_timeout());

        info!("  Creating listeners...");
        let listeners = Arc::new(ListenerSet::new(&listener, handler, stats.clone()));
        let bound = listeners.start().await;
        info!("Listening on {} of {} ports", bound.len(), listener.ports().len());

        Ok(Self {
            listeners,
            coordinator,
            mqtt,
            stats,
            handles: vec![coordinator_handle, mqtt_handle],
        })
    }

    /// Closes the listening ports, then drains the coordinator and MQTT.
    pub async fn stop(self) {
        info!("Stopping all components...");

        self.listeners.stop().await;
        self.coordinator.stop();
        self.mqtt.stop();

        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Error waiting for task: {}", e);
            }
        }

        info!("Shutdown complete");
    }
}

fn init_logging(default_filter: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

/// Main application entry point
///
/// Runs until `shutdown_rx` fires or the optional runtime limit passes.
pub async fn app(
    mut shutdown_rx: broadcast::Receiver<()>,
    options: Options,
) -> Result<()> {
    let config = match ConfigWrapper::new(options.config_file.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_logging("info");
            error!("Failed to load config {}: {:?}", options.config_file, err);
            return Err(err);
        }
    };

    init_logging(&config.loglevel());

    info!(
        "apsystems-ecu-proxy {} starting with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.log_summary();

    let components = Components::start(config, options.no_forward).await?;

    info!("Waiting for shutdown signal...");
    match options.runtime {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_rx.recv() => info!("Shutdown signal received"),
                () = tokio::time::sleep(std::time::Duration::from_secs(secs)) => {
                    info!("Runtime limit of {}s reached", secs)
                }
            }
        }
        None => {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received");
        }
    }

    let stats = components.stats.clone();
    components.stop().await;

    if let Ok(stats) = stats.lock() {
        stats.print_summary();
    }

    info!("Application shutdown complete");
    Ok(())
}
