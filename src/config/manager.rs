//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const MIN_SEND_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SEND_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const MAX_CLIENT_NAME_LEN: usize = 255;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist. Missing keys take their default values.
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from `CHATRELAY_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("CHATRELAY_BIND_ADDR") {
            self.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid CHATRELAY_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(interval) = lookup("CHATRELAY_SEND_RETRY_INTERVAL") {
            self.server.send_retry_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid CHATRELAY_SEND_RETRY_INTERVAL: {}", interval))?;
        }

        if let Some(nodelay) = lookup("CHATRELAY_TCP_NODELAY") {
            self.server.tcp_nodelay = nodelay
                .parse::<bool>()
                .with_context(|| format!("Invalid CHATRELAY_TCP_NODELAY: {}", nodelay))?;
        }

        if let Some(server_addr) = lookup("CHATRELAY_SERVER_ADDR") {
            self.client.server_addr = server_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid CHATRELAY_SERVER_ADDR: {}", server_addr))?;
        }

        if let Some(name) = lookup("CHATRELAY_NAME") {
            self.client.name = name;
        }

        if let Some(log_level) = lookup("CHATRELAY_LOG_LEVEL") {
            self.monitoring.log_level = log_level;
        }

        if let Some(enabled) = lookup("CHATRELAY_MANAGEMENT_ENABLED") {
            self.monitoring.management_api.enabled = enabled
                .parse::<bool>()
                .with_context(|| format!("Invalid CHATRELAY_MANAGEMENT_ENABLED: {}", enabled))?;
        }

        if let Some(addr) = lookup("CHATRELAY_MANAGEMENT_ADDR") {
            self.monitoring.management_api.bind_addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid CHATRELAY_MANAGEMENT_ADDR: {}", addr))?;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_client_config()
            .with_context(|| "Client configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let interval = self.server.send_retry_interval;
        if interval < MIN_SEND_RETRY_INTERVAL {
            bail!(
                "send_retry_interval must be at least {:?}",
                MIN_SEND_RETRY_INTERVAL
            );
        }

        if interval > MAX_SEND_RETRY_INTERVAL {
            bail!("send_retry_interval cannot exceed {:?}", MAX_SEND_RETRY_INTERVAL);
        }

        Ok(())
    }

    fn validate_client_config(&self) -> Result<()> {
        if self.client.name.is_empty() {
            bail!("client.name must not be empty");
        }

        if self.client.name.len() > MAX_CLIENT_NAME_LEN {
            bail!("client.name exceeds {} bytes", MAX_CLIENT_NAME_LEN);
        }

        if self.client.server_addr.port() == 0 {
            bail!("client.server_addr must name a concrete port");
        }

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        if self.monitoring.management_api.enabled && !self.monitoring.metrics_enabled {
            tracing::warn!("Management API enabled with metrics disabled; /metrics will be empty");
        }

        Ok(())
    }

    /// Merge with CLI arguments.
    ///
    /// Fails on a bind address that does not parse, leaving `self` untouched.
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        server: Option<SocketAddr>,
        name: Option<&str>,
        management_addr: Option<SocketAddr>,
        log_level: Option<&str>,
    ) -> Result<()> {
        if let Some(bind_str) = bind {
            let addr = bind_str
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", bind_str))?;
            self.server.bind_addr = addr;
            tracing::info!("CLI override: bind address set to {}", addr);
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(addr) = server {
            self.client.server_addr = addr;
            tracing::info!("CLI override: server address set to {}", addr);
        }

        if let Some(name) = name {
            self.client.name = name.to_string();
            tracing::info!("CLI override: name set to {}", name);
        }

        if let Some(addr) = management_addr {
            self.monitoring.management_api.enabled = true;
            self.monitoring.management_api.bind_addr = addr;
            tracing::info!("CLI override: management API enabled on {}", addr);
        }

        if let Some(level) = log_level {
            self.monitoring.log_level = level.to_string();
        }

        Ok(())
    }
}
