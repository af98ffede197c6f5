//! Configuration system for the LidarLink CLI.

use lidarlink_core::BroadcastCode;
use lidarlink_discovery::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// LidarLink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Command channel configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Broadcast listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Local address for candidate and command sockets
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Reactor timer period in milliseconds
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,
    /// Kernel receive buffer size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recv_buffer_size: Option<usize>,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Broadcast codes of directly connected sensors to connect to
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Broadcast code of the hub, for hub topology
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,
    /// Base of the negotiated port range
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    /// Command port offset
    #[serde(default = "default_cmd_port_offset")]
    pub cmd_port_offset: u16,
    /// Point data port offset
    #[serde(default = "default_data_port_offset")]
    pub data_port_offset: u16,
    /// Sensor data port offset
    #[serde(default = "default_data_port_offset")]
    pub sensor_port_offset: u16,
    /// Handshake timeout in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Command channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Device port commands are sent to (broadcast source port if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_command_port: Option<u16>,
    /// Heartbeat period in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence before a device is dropped, in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Command ack timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:55000".to_string()
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_timer_interval_ms() -> u64 {
    100
}

fn default_port_base() -> u16 {
    lidarlink_core::DISCOVERY_PORT
}

fn default_cmd_port_offset() -> u16 {
    500
}

fn default_data_port_offset() -> u16 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    500
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    3000
}

fn default_command_timeout_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bind_ip: default_bind_ip(),
            timer_interval_ms: default_timer_interval_ms(),
            recv_buffer_size: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            whitelist: Vec::new(),
            hub: None,
            port_base: default_port_base(),
            cmd_port_offset: default_cmd_port_offset(),
            data_port_offset: default_data_port_offset(),
            sensor_port_offset: default_data_port_offset(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            device_command_port: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lidarlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {e}", self.network.listen_addr))
    }

    /// Parse bind address as `IpAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.network
            .bind_ip
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {e}", self.network.bind_ip))
    }

    /// Whitelisted sensor codes
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid code.
    pub fn whitelist_codes(&self) -> anyhow::Result<Vec<BroadcastCode>> {
        self.discovery
            .whitelist
            .iter()
            .map(|code| parse_code(code, "Whitelist entry"))
            .collect()
    }

    /// Hub code, if configured
    ///
    /// # Errors
    ///
    /// Returns an error if the code is invalid.
    pub fn hub_code(&self) -> anyhow::Result<Option<BroadcastCode>> {
        self.discovery
            .hub
            .as_deref()
            .map(|code| parse_code(code, "Hub code"))
            .transpose()
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.parse_bind_ip()?;
        self.whitelist_codes()?;
        self.hub_code()?;

        // Every port of the first allocation must fit in u16
        let discovery = &self.discovery;
        for (name, offset) in [
            ("cmd_port_offset", discovery.cmd_port_offset),
            ("data_port_offset", discovery.data_port_offset),
            ("sensor_port_offset", discovery.sensor_port_offset),
        ] {
            if discovery
                .port_base
                .checked_add(offset)
                .and_then(|port| port.checked_add(1))
                .is_none()
            {
                anyhow::bail!(
                    "port_base {} + {} {} exceeds the port range",
                    discovery.port_base,
                    name,
                    offset
                );
            }
        }

        if discovery.handshake_timeout_ms == 0 {
            anyhow::bail!("Handshake timeout must be greater than zero");
        }
        if self.network.timer_interval_ms == 0 {
            anyhow::bail!("Timer interval must be greater than zero");
        }

        let channel = &self.channel;
        if channel.heartbeat_interval_ms == 0 || channel.command_timeout_ms == 0 {
            anyhow::bail!("Heartbeat interval and command timeout must be greater than zero");
        }
        if channel.heartbeat_timeout_ms <= channel.heartbeat_interval_ms {
            anyhow::bail!(
                "Heartbeat timeout ({} ms) must exceed the heartbeat interval ({} ms)",
                channel.heartbeat_timeout_ms,
                channel.heartbeat_interval_ms
            );
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Build the service configuration
    ///
    /// # Errors
    ///
    /// Returns an error if an address cannot be parsed.
    pub fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let bind_ip = self.parse_bind_ip()?;
        let mut config = ServiceConfig::default();

        config.transport.timer_interval = Duration::from_millis(self.network.timer_interval_ms);
        config.transport.recv_buffer_size = self.network.recv_buffer_size;

        config.discovery.listen_addr = self.parse_listen_addr()?;
        config.discovery.bind_ip = bind_ip;
        config.discovery.port_base = self.discovery.port_base;
        config.discovery.cmd_port_offset = self.discovery.cmd_port_offset;
        config.discovery.data_port_offset = self.discovery.data_port_offset;
        config.discovery.sensor_port_offset = self.discovery.sensor_port_offset;
        config.discovery.handshake_timeout =
            Duration::from_millis(self.discovery.handshake_timeout_ms);

        config.channel.bind_ip = bind_ip;
        config.channel.device_command_port = self.channel.device_command_port;
        config.channel.heartbeat_interval = Duration::from_millis(self.channel.heartbeat_interval_ms);
        config.channel.heartbeat_timeout = Duration::from_millis(self.channel.heartbeat_timeout_ms);
        config.channel.command_timeout = Duration::from_millis(self.channel.command_timeout_ms);

        Ok(config)
    }
}

/// Parse a broadcast code with a readable error
pub fn parse_code(code: &str, name: &str) -> anyhow::Result<BroadcastCode> {
    BroadcastCode::parse(code).map_err(|e| anyhow::anyhow!("{name} '{code}' is invalid: {e}"))
}
