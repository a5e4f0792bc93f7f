//! CLI Entry Point for sensord
//!
//! Provides command-line interface for:
//! - Running the daemon with simulated sensors
//! - Showing the effective configuration
//! - Listing the configured sensors and what they advertise
//! - Streaming samples from one sensor (a minimal client)
//!
//! # Usage
//!
//! Start the daemon:
//! ```bash
//! sensord daemon --config config/sensord.toml
//! ```
//!
//! Watch an accelerometer at 50 ms:
//! ```bash
//! sensord watch accel --interval 50 --count 20
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use sensord::client::{DataReader, SensorClient, SensorSession};
use sensord::config::{DaemonConfig, SensorDefinition, DEFAULT_CONFIG_PATH};
use sensord::hardware::{DeviceAdaptor, MockSensor};
use sensord::network::{ControlServer, SessionManager};
use sensord::sensor::frame::{Frame, SensorType, TimedUnsigned, XyzSample};
use sensord::tracing_config::{self, OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "sensord")]
#[command(about = "Sensor sharing daemon with per-session arbitration", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured sensors
    Daemon {
        /// Log output format
        #[arg(long, value_enum, default_value = "compact")]
        log_format: OutputFormat,
    },

    /// Print the effective configuration (file merged with environment)
    Config,

    /// Print the configured sensors and their capability catalogs
    Sensors,

    /// Open a session on a sensor and print its samples
    Watch {
        /// Sensor id
        sensor: String,

        /// Requested sampling interval in ms
        #[arg(long)]
        interval: Option<u32>,

        /// Stop after this many samples
        #[arg(long, default_value = "10")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Daemon { log_format } => run_daemon(config, log_format).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Sensors => list_sensors(&config),
        Commands::Watch {
            sensor,
            interval,
            count,
        } => watch(&config, &sensor, interval, count).await,
    }
}

async fn run_daemon(config: DaemonConfig, log_format: OutputFormat) -> Result<()> {
    let tracing = TracingConfig::from_daemon_config(&config)
        .map_err(|e| anyhow!(e))?
        .with_format(log_format);
    tracing_config::init(tracing).map_err(|e| anyhow!(e))?;

    let manager = SessionManager::new(config.daemon.max_sessions, config.daemon.default_buffer_size);
    for definition in config.enabled_sensors() {
        manager
            .register_sensor(
                &definition.id,
                definition.description.clone(),
                Arc::new(build_adaptor(definition)?),
            )
            .await
            .with_context(|| format!("registering sensor '{}'", definition.id))?;
    }

    let server = ControlServer::bind(
        &config.daemon.control_socket,
        &config.daemon.data_socket_dir,
        manager,
        config.daemon.max_message_size,
    )
    .await?;
    info!(
        name = %config.application.name,
        sensors = config.enabled_sensors().len(),
        "daemon started"
    );

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;
    info!("daemon stopped");
    Ok(())
}

/// Simulated device for a configured sensor, rate limit applied.
fn build_adaptor(definition: &SensorDefinition) -> Result<MockSensor> {
    let sensor_type = definition.sensor_type().map_err(|e| anyhow!(e))?;
    let mock = MockSensor::for_type(sensor_type);
    Ok(match definition.min_interval_ms() {
        Some(min_interval) => {
            let catalog = mock.catalog().with_min_interval(min_interval);
            mock.with_catalog(catalog)
        }
        None => mock,
    })
}

fn list_sensors(config: &DaemonConfig) -> Result<()> {
    for definition in config.enabled_sensors() {
        let adaptor = build_adaptor(definition)?;
        let catalog = adaptor.catalog();
        println!(
            "{} ({}, {} B records): {}",
            definition.id,
            adaptor.sensor_type(),
            adaptor.sensor_type().frame_size(),
            definition
                .description
                .clone()
                .unwrap_or_else(|| adaptor.description())
        );
        println!("  intervals (ms):   {:?}", catalog.intervals);
        println!("  data ranges:      {:?}", catalog.data_ranges);
        println!("  buffer intervals: {:?}", catalog.buffer_intervals);
        println!("  buffer sizes:     {:?}", catalog.buffer_sizes);
        println!(
            "  defaults:         interval {} ms, data range #{}",
            catalog.default_interval, catalog.default_data_range
        );
    }
    Ok(())
}

async fn watch(config: &DaemonConfig, sensor: &str, interval: Option<u32>, count: usize) -> Result<()> {
    let client = SensorClient::connect(&config.daemon.control_socket).await?;
    let session = client.open(sensor).await?;
    if let Some(interval) = interval {
        session.set_interval(interval).await?;
    }
    session.start().await?;
    println!(
        "session {} on {} ({}), effective {:?}",
        session.session_id(),
        session.id(),
        session.sensor_type(),
        session.effective().await?
    );

    let result = match session.sensor_type() {
        SensorType::Accelerometer | SensorType::Magnetometer | SensorType::Gyroscope => {
            print_samples::<XyzSample>(&session, count).await
        }
        SensorType::Als | SensorType::Proximity => print_samples::<TimedUnsigned>(&session, count).await,
    };
    session.release().await?;
    result
}

async fn print_samples<T: Frame + std::fmt::Debug>(session: &SensorSession, count: usize) -> Result<()> {
    let mut reader: DataReader<T, _> = session.connect_data::<T>().await?;
    let mut printed = 0;
    while printed < count {
        match reader.data_received().await {
            Ok(batch) => {
                for sample in batch.iter().take(count - printed) {
                    println!("{:?}", sample);
                }
                printed += batch.len().min(count - printed);
            }
            Err(e) if !e.is_terminal() => println!("! {}", e),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
