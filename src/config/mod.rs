//! Configuration management
//!
//! Layered as built-in defaults, then an optional TOML file, then
//! `B2BUA__SECTION__KEY` environment variables.

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sip: SipConfig,
    pub auth: AuthConfig,
    pub admin: AdminConfig,
    pub console: ConsoleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub domain: String,
    pub enable_tcp: bool,
    pub user_agent: String,
    /// Address written into Via and Contact; the bind address when empty
    #[serde(default)]
    pub advertised_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub realm: String,
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig {
                bind_address: "0.0.0.0".to_string(),
                bind_port: 5060,
                domain: "localhost".to_string(),
                enable_tcp: true,
                user_agent: "Rust B2BUA/1.0.0".to_string(),
                advertised_address: String::new(),
            },
            auth: AuthConfig {
                enabled: true,
                realm: "b2bua".to_string(),
                accounts: ["100", "200"]
                    .into_iter()
                    .map(|user| AccountConfig {
                        username: user.to_string(),
                        password: user.to_string(),
                    })
                    .collect(),
            },
            admin: AdminConfig {
                enabled: true,
                bind: "0.0.0.0:6658".to_string(),
            },
            console: ConsoleConfig { enabled: true },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load the layered configuration, reading `path` when given
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder
            .add_source(Environment::with_prefix("B2BUA").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from TOML text layered over the defaults
    pub fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

impl SipConfig {
    pub fn bind_socket(&self) -> Result<SocketAddr, config::ConfigError> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            config::ConfigError::Message(format!("invalid sip.bind_address: {}", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.bind_port))
    }

    /// Address other parties should reach us at
    pub fn advertised_ip(&self) -> Result<IpAddr, config::ConfigError> {
        if !self.advertised_address.is_empty() {
            return self.advertised_address.parse().map_err(|_| {
                config::ConfigError::Message(format!(
                    "invalid sip.advertised_address: {}",
                    self.advertised_address
                ))
            });
        }
        let ip = self.bind_socket()?.ip();
        Ok(if ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            ip
        })
    }
}

impl AdminConfig {
    pub fn bind_socket(&self) -> Result<SocketAddr, config::ConfigError> {
        self.bind
            .parse()
            .map_err(|_| config::ConfigError::Message(format!("invalid admin.bind: {}", self.bind)))
    }
}
