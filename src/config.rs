use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default telemetry delivery interval in milliseconds.
pub const DEFAULT_DELIVERY_INTERVAL_MS: u64 = 5000;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Only set if not already set (env vars take precedence)
            if std::env::var(key).is_err() {
                // SAFETY: We're single-threaded at this point (called before any async runtime)
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub telemetry: TelemetryConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub scope_id: Option<String>,
    pub device_key: Option<String>,
    pub connection_string: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Process-wide default sampling interval in milliseconds.
    pub default_interval_ms: u64,
    /// Start every sensor in simulated mode (synthetic samples).
    pub simulated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                device_id: "sensor-twin-device".to_string(),
                scope_id: None,
                device_key: None,
                connection_string: None,
            },
            telemetry: TelemetryConfig {
                default_interval_ms: DEFAULT_DELIVERY_INTERVAL_MS,
                simulated: true,
            },
            mqtt: MqttConfig {
                broker_host: "127.0.0.1".to_string(),
                broker_port: 1883,
                client_id: "sensor-twin-bridge".to_string(),
                username: None,
                password: None,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("DEVICE_ID") {
            config.device.device_id = id;
        }
        if let Ok(scope) = std::env::var("SCOPE_ID") {
            config.device.scope_id = Some(scope);
        }
        if let Ok(key) = std::env::var("DEVICE_KEY") {
            config.device.device_key = Some(key);
        }
        if let Ok(cstring) = std::env::var("CONNECTION_STRING") {
            config.device.connection_string = Some(cstring);
        }
        if let Ok(interval) = std::env::var("TELEMETRY_INTERVAL_MS")
            && let Ok(ms) = interval.parse()
        {
            config.telemetry.default_interval_ms = ms;
        }
        if let Ok(simulated) = std::env::var("SIMULATED")
            && let Ok(s) = simulated.parse()
        {
            config.telemetry.simulated = s;
        }

        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }

        config
    }
}
