use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rain_gauge_node::config::Config;
use rain_gauge_node::downlink::DownlinkCommandHandler;
use rain_gauge_node::gwmp::GwmpStack;
use rain_gauge_node::lifecycle::{Device, DeviceSettings};
use rain_gauge_node::rain::RainSource;
use rain_gauge_node::scheduler::DutyCycleConfig;
use rain_gauge_node::stack::{DeviceClass, FixedBattery, Region, SystemClock};
use rain_gauge_node::SharedState;

#[derive(Parser)]
#[command(name = "rain-gauge-node")]
#[command(about = "LoRaWAN tipping-bucket rain gauge node")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the duty cycle base period
    #[arg(long)]
    base_period_ms: Option<u32>,

    /// Override the jitter RNG seed
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });
    if let Some(period) = cli.base_period_ms {
        config.duty_cycle.base_period_ms = period;
    }
    if let Some(seed) = cli.seed {
        config.simulator.seed = seed;
    }

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!("Rain gauge node v{}", env!("CARGO_PKG_VERSION"));

    let class: DeviceClass = config.device.class.parse()?;
    let region: Region = config.device.region.parse()?;
    let dev_addr = config.dev_addr()?;
    let duty = DutyCycleConfig::from(&config.duty_cycle);
    let seed = match config.simulator.seed {
        0 => SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos() as u64,
        seed => seed,
    };

    info!(
        "DevAddr {:08X}, {} {}, period {} ms (+{} ms jitter), watchdog {} ms, policy {:?}",
        dev_addr,
        region,
        class,
        duty.base_period_ms,
        duty.jitter_max_ms,
        duty.watchdog_period_ms,
        config.device.unjoined_policy
    );

    let shared = Arc::new(SharedState::new(duty, config.debounce.quiet_window_ms));
    let edge = Arc::new(Notify::new());
    let clock = SystemClock::new();

    let handler = DownlinkCommandHandler::new(shared.clone());
    let stack = GwmpStack::start(
        &config.network,
        dev_addr,
        config.device.app_port,
        handler,
        edge.clone(),
    )
    .await?;

    if config.simulator.tip_interval_ms > 0 {
        info!(
            "Synthetic rain: one tip every ~{} ms",
            config.simulator.tip_interval_ms
        );
        RainSource::new(config.simulator.tip_interval_ms, seed.rotate_left(17))
            .spawn(shared.clone(), clock, edge.clone());
    }

    let settings = DeviceSettings {
        class,
        region,
        policy: config.device.unjoined_policy,
        seed,
    };
    let mut device = Device::new(
        stack,
        FixedBattery(config.simulator.battery_mv),
        clock,
        shared,
        settings,
    );

    tokio::select! {
        _ = device.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down in state {}", device.state());
        }
    }

    Ok(())
}
