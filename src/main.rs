use clap::Parser;
use log::{error, info};
use sensor_twin_bridge::actuator::PulseActuator;
use sensor_twin_bridge::cloud::{CloudConnector, Credentials, LoopbackHub, MqttTwinConnector};
use sensor_twin_bridge::config::{Config, load_dotenv};
use sensor_twin_bridge::context::AgentContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "sensor-twin-bridge")]
#[command(about = "Sensor telemetry, device-twin sync, and remote command execution")]
struct Cli {
    /// Connect through the MQTT twin client instead of the in-process
    /// loopback hub.
    #[arg(long)]
    mqtt: bool,

    /// Device id, overriding the environment configuration.
    #[arg(long, env = "DEVICE_ID")]
    device_id: Option<String>,

    /// Base64 credential envelope as carried by device QR codes.
    #[arg(long, env = "CREDENTIALS_QR")]
    credentials: Option<String>,

    /// Sensor to enable at startup (repeatable); all sensors if omitted.
    #[arg(long = "enable", value_name = "SENSOR")]
    enable: Vec<String>,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    init_logger();
    load_dotenv();
    let cli = Cli::parse();

    info!("Starting Sensor Twin Bridge");

    let mut config = Config::from_env();
    if let Some(device_id) = &cli.device_id {
        config.device.device_id = device_id.clone();
    }
    info!("Configuration loaded:");
    info!("  Device Id: {}", config.device.device_id);
    info!("  Interval: {}ms", config.telemetry.default_interval_ms);
    info!("  Simulated: {}", config.telemetry.simulated);
    info!("  Transport: {}", if cli.mqtt { "mqtt" } else { "loopback" });

    let loopback = (!cli.mqtt).then(LoopbackHub::new);
    let connector: Arc<dyn CloudConnector> = match &loopback {
        Some(hub) => Arc::new(hub.clone()),
        None => Arc::new(MqttTwinConnector::new(config.mqtt.clone())),
    };

    let context = AgentContext::new(config, connector, Arc::new(PulseActuator::new()));

    let credentials = match &cli.credentials {
        Some(envelope) => Credentials::from_qr_envelope(envelope),
        None => Credentials::from_device_config(&context.config.device),
    };
    let credentials = match credentials {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("Invalid credentials: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = context.session.connect(credentials).await {
        error!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    // Bring up the requested sensors; the rest stay disabled until a remote
    // command enables them.
    if cli.enable.is_empty() {
        for sensor in context.registry.sensors() {
            if let Err(e) = sensor.enable(true) {
                error!("{}: enable failed: {}", sensor.id(), e);
            }
        }
    } else {
        for id in &cli.enable {
            match context.registry.sensor(id) {
                Some(sensor) => {
                    if let Err(e) = sensor.enable(true) {
                        error!("{}: enable failed: {}", id, e);
                    }
                }
                None => error!("Unknown sensor: {}", id),
            }
        }
    }

    info!("Sensor Twin Bridge is running");
    info!("  - {} sensors registered", context.registry.len());
    info!("  - Press Ctrl+C to exit");

    // Against the loopback hub, play the cloud side: push a command and a
    // property delta periodically so the full inbound path is exercised.
    let cloud_task = loopback.map(|hub| {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            let mut fan_speed = 0u64;
            loop {
                interval.tick().await;
                if !hub.is_device_connected() {
                    continue;
                }
                info!("Simulating remote light toggle...");
                hub.push_command("lightToggle", r#"{"pulses":2}"#);

                fan_speed += 1;
                hub.push_property(
                    "settings",
                    serde_json::json!({"__t": "c", "fanSpeed": fan_speed}),
                );
            }
        })
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Some(task) = cloud_task {
        task.abort();
    }
    for sensor in context.registry.sensors() {
        let _ = sensor.enable(false);
    }
    context.session.disconnect().await;
    info!("Sensor Twin Bridge stopped");
}
