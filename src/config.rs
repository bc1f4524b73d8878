use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

use crate::backend::{
    Backend, BackendStrategy, DEFAULT_CONNECT_TIMEOUT, Destination, Registry, RoundRobin,
    normalize_host,
};
use crate::sniff::DEFAULT_SNIFF_TIMEOUT;
use crate::tls::load_tls_config;

/// Configuration document as written by the operator.
#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default, alias = "upstreams")]
    pub frontends: BTreeMap<String, FrontendConfig>,
    pub traffic_counter: Option<TrafficCounterConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    #[serde(default)]
    pub bind_addr: String,
    #[serde(default)]
    pub https: bool,
    /// Milliseconds.
    pub sniff_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FrontendConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub strategy: StrategyKind,
    pub tls_crt: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub addr: String,
    /// Milliseconds.
    pub connect_timeout: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    #[serde(alias = "round-robin")]
    RoundRobin,
}

impl StrategyKind {
    fn build(self) -> Box<dyn BackendStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrafficCounterConfig {
    pub redis_url: String,
}

/// One bound port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub bind_addr: String,
    pub https: bool,
    pub sniff_timeout: Duration,
}

/// Validated, read-only runtime configuration.
#[derive(Debug)]
pub struct Configuration {
    pub listeners: Vec<ListenerSettings>,
    pub registry: Arc<Registry>,
    pub traffic_counter: Option<TrafficCounterConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("You must specify a bind_addr for every listener")]
    MissingBindAddr,
    #[error("You must specify at least one backend for frontend '{0}'")]
    NoBackends(String),
    #[error("You must specify an addr for each backend on frontend '{0}'")]
    MissingBackendAddr(String),
    #[error("Only one frontend may be the default ('{first}' and '{second}' are both marked)")]
    MultipleDefaults { first: String, second: String },
    #[error("Frontend '{0}' must set both tls_crt and tls_key")]
    IncompleteTls(String),
    #[error("Failed to load TLS configuration for frontend '{name}': {reason}")]
    Tls { name: String, reason: String },
    #[error("Frontend names '{0}' and '{1}' are the same host")]
    DuplicateFrontend(String, String),
}

/// Which parser a configuration file goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Yaml,
}

impl Format {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Toml,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Configuration> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
    let file = ConfigFile::parse(&content, Format::from_path(path))?;
    Ok(file.validate()?)
}

impl ConfigFile {
    pub fn parse(content: &str, format: Format) -> Result<Self> {
        match format {
            Format::Toml => {
                toml::from_str(content).context("Failed to parse configuration file as valid TOML")
            }
            Format::Yaml => serde_yaml::from_str(content)
                .context("Failed to parse configuration file as valid YAML"),
        }
    }

    pub fn validate(self) -> Result<Configuration, ConfigError> {
        self.validate_with(load_tls_config)
    }

    /// Validates the document, loading TLS material through `load_tls`.
    pub fn validate_with<F>(self, load_tls: F) -> Result<Configuration, ConfigError>
    where
        F: Fn(&Path, &Path) -> Result<Arc<rustls::ServerConfig>>,
    {
        let listeners = self
            .listeners
            .into_iter()
            .map(|listener| {
                if listener.bind_addr.trim().is_empty() {
                    return Err(ConfigError::MissingBindAddr);
                }
                Ok(ListenerSettings {
                    bind_addr: listener.bind_addr,
                    https: listener.https,
                    sniff_timeout: listener
                        .sniff_timeout
                        .map_or(DEFAULT_SNIFF_TIMEOUT, Duration::from_millis),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut default_name: Option<String> = None;
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut destinations = Vec::with_capacity(self.frontends.len());

        for (name, front) in self.frontends {
            if front.backends.is_empty() {
                return Err(ConfigError::NoBackends(name));
            }
            if let Some(previous) = seen.insert(normalize_host(&name), name.clone()) {
                return Err(ConfigError::DuplicateFrontend(previous, name));
            }
            if front.default {
                if let Some(first) = default_name {
                    return Err(ConfigError::MultipleDefaults {
                        first,
                        second: name,
                    });
                }
                default_name = Some(name.clone());
            }

            let backends = front
                .backends
                .into_iter()
                .map(|back| {
                    if back.addr.trim().is_empty() {
                        return Err(ConfigError::MissingBackendAddr(name.clone()));
                    }
                    Ok(Backend::new(
                        back.addr.trim(),
                        back.connect_timeout
                            .filter(|ms| *ms > 0)
                            .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
                    ))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut destination = Destination::new(name.as_str(), backends).with_default(front.default);
            match (&front.tls_crt, &front.tls_key) {
                (Some(crt), Some(key)) => {
                    let tls = load_tls(crt, key).map_err(|e| ConfigError::Tls {
                        name: name.clone(),
                        reason: format!("{e:#}"),
                    })?;
                    destination = destination.with_tls(tls);
                }
                (None, None) => {}
                _ => return Err(ConfigError::IncompleteTls(name)),
            }
            destinations.push(destination.with_strategy(front.strategy.build()));
        }

        Ok(Configuration {
            listeners,
            registry: Arc::new(Registry::new(destinations)),
            traffic_counter: self.traffic_counter,
        })
    }
}
