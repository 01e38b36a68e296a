use clap::Parser;
use kc868_mqtt_bridge::Bridge;
use kc868_mqtt_bridge::config::{self, Config};
use log::{LevelFilter, error, info, warn};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kc868-mqtt-bridge")]
#[command(about = "Bridge a KC868 relay controller to an MQTT broker")]
struct Cli {
    /// TOML config file; searched in /etc, ~/.config and . when omitted
    #[arg(long, env = "APPLICATION_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Dotenv-style file with APPLICATION_* settings
    #[arg(long, env = "APPLICATION_ENV_FILE", default_value = ".env")]
    env_file: PathBuf,

    /// Log level (error, warn, info, debug, trace), overrides APPLICATION_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() {
    let cli = Cli::parse();

    // Load the env file before the runtime starts its worker threads
    let loaded = config::load_env_file(&cli.env_file);

    let config_file = cli
        .config
        .clone()
        .or_else(|| config::find_config_file(&config::config_search_dirs()));
    let (settings, file_error) = match config_file.as_deref().map(config::read_config_file).transpose() {
        Ok(settings) => (settings, None),
        Err(e) => (None, Some(e)),
    };

    let config = Config::from_env(settings.as_ref());
    let requested = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let level_valid = requested.parse::<LevelFilter>().is_ok();
    init_logger(if level_valid {
        requested
    } else {
        config::DEFAULT_LOG_LEVEL
    });
    if !level_valid {
        warn!(
            "Wrong log level {}, set default log level {}",
            requested,
            config::DEFAULT_LOG_LEVEL
        );
    }

    if let Some(e) = file_error {
        error!("Error on loading configuration --> {}", e);
        std::process::exit(1);
    }

    info!("Starting KC868 MQTT bridge");
    match &config_file {
        Some(path) => info!("  Config file: {}", path.display()),
        None => warn!("Config file not found, using environment and defaults"),
    }
    if loaded > 0 {
        info!("  Loaded {} settings from {}", loaded, cli.env_file.display());
    }
    info!(
        "  Device: {} at {}:{}",
        config.device.name, config.device.host, config.device.port
    );
    info!(
        "  Broker: {}:{} topics {}/{}/{}",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.mqtt.topic_prefix,
        config.mqtt.device_type,
        config.mqtt.group_id
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("Bridge failed to start: {}", e);
        std::process::exit(1);
    }

    info!("KC868 MQTT bridge stopped");
}

async fn run(config: Config) -> kc868_mqtt_bridge::Result<()> {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    Bridge::new(config).run(cancel).await
}
