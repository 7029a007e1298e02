use crate::prelude::*;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub decoder: Decoder,
    #[serde(default)]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Listener {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Listener {
    #[serde(default = "Config::default_listener_host")]
    pub host: String,
    #[serde(default = "Config::default_ports")]
    pub ports: Vec<u16>,

    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default = "Config::default_keepalive")]
    pub keepalive: Option<Duration>,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub read_timeout: Option<Duration>,
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            host: Config::default_listener_host(),
            ports: Config::default_ports(),
            keepalive: Config::default_keepalive(),
            read_timeout: None,
            max_connections: None,
        }
    }
}

impl Listener {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }
} // }}}

// Upstream {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Upstream {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_upstream_host")]
    pub host: String,

    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            enabled: Config::default_enabled(),
            host: Config::default_upstream_host(),
            timeout: None,
        }
    }
}

impl Upstream {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
} // }}}

// Decoder {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Decoder {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_max_age")]
    pub max_age: Duration,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            max_age: Config::default_max_age(),
        }
    }
}

impl Decoder {
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
} // }}}

// HomeAssistant {{{
#[derive(Clone, Debug, Deserialize)]
pub struct HomeAssistant {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_homeassistant_prefix")]
    pub prefix: String,
}

impl Default for HomeAssistant {
    fn default() -> Self {
        Self {
            enabled: Config::default_enabled(),
            prefix: Config::default_mqtt_homeassistant_prefix(),
        }
    }
}

impl HomeAssistant {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub homeassistant: HomeAssistant,
}

// an absent mqtt section means no broker; a present one is on unless it says otherwise
impl Default for Mqtt {
    fn default() -> Self {
        Self {
            enabled: false,
            host: Config::default_mqtt_host(),
            port: Config::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Config::default_mqtt_namespace(),
            homeassistant: HomeAssistant::default(),
        }
    }
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn homeassistant(&self) -> &HomeAssistant {
        &self.homeassistant
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        // a poisoned lock still holds a valid config, nothing mutates it partially
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn listener(&self) -> Listener {
        self.lock().listener.clone()
    }

    pub fn upstream(&self) -> Upstream {
        self.lock().upstream.clone()
    }

    pub fn decoder(&self) -> Decoder {
        self.lock().decoder.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn homeassistant_enabled(&self) -> bool {
        let config = self.lock();
        config.mqtt.enabled && config.mqtt.homeassistant.enabled
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }

    pub fn log_summary(&self) {
        self.lock().log_summary();
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("config.rs:error reading {}: {}", file, err))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Listener:");
        info!("    Host: {}", self.listener.host);
        info!("    Ports: {:?}", self.listener.ports);
        info!("    Keepalive: {:?}", self.listener.keepalive);
        info!("    Read Timeout: {:?}", self.listener.read_timeout);
        match self.listener.max_connections {
            Some(max) => info!("    Max Connections: {}", max),
            None => info!("    Max Connections: unlimited"),
        }

        info!("  Upstream: {}", if self.upstream.enabled { "enabled" } else { "disabled" });
        if self.upstream.enabled {
            info!("    Host: {}", self.upstream.host);
            info!("    Timeout: {:?}", self.upstream.timeout);
        }

        info!("  Decoder:");
        info!("    Max Age: {}s", self.decoder.max_age.as_secs());

        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
            info!(
                "    Home Assistant: {}",
                if self.mqtt.homeassistant.enabled { "enabled" } else { "disabled" }
            );
        }

        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.listener.ports.is_empty() {
            bail!("listener.ports must list at least one port");
        }

        // port 0 asks the OS for an ephemeral port, so it may repeat
        let mut seen = HashSet::new();
        for port in self.listener.ports.iter().filter(|p| **p != 0) {
            if !seen.insert(port) {
                bail!("listener.ports contains {} more than once", port);
            }
        }

        if self.listener.host.is_empty() {
            return Err(anyhow!("config.rs:listener host cannot be empty"));
        }
        if self.listener.max_connections == Some(0) {
            bail!("listener.max_connections must be at least 1");
        }
        if self.listener.read_timeout == Some(Duration::ZERO) {
            return Err(anyhow!("config.rs:Invalid read timeout: 0"));
        }

        if self.upstream.enabled && self.upstream.host.is_empty() {
            return Err(anyhow!("config.rs:upstream host cannot be empty"));
        }

        if self.decoder.max_age.is_zero() {
            bail!("decoder.max_age must be greater than 0");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(anyhow!("config.rs:MQTT host cannot be empty"));
            }
        }

        Ok(())
    }

    fn default_listener_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_ports() -> Vec<u16> {
        vec![8995, 8996, 8997]
    }

    fn default_keepalive() -> Option<Duration> {
        Some(Duration::from_secs(60))
    }

    fn default_upstream_host() -> String {
        "ecu.apsystemsema.com".to_string()
    }

    fn default_max_age() -> Duration {
        ecu::message::DEFAULT_MAX_AGE
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "apsystems".to_string()
    }

    fn default_mqtt_homeassistant_prefix() -> String {
        "homeassistant".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
