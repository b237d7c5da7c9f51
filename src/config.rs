use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Names each role answers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identities {
    pub client: String,
    pub authentication: String,
    pub ticket_granting: String,
    pub service: String,
}

impl Default for Identities {
    fn default() -> Self {
        Self {
            client: "Client".to_string(),
            authentication: "AS".to_string(),
            ticket_granting: "TGS".to_string(),
            service: "Server".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn local(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Listening endpoints. Ports default to the well-known realm layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// AS bootstrap receiver, serving the client then the TGS.
    pub bootstrap_authentication: Endpoint,
    /// TGS bootstrap receiver, serving the service.
    pub bootstrap_ticket_granting: Endpoint,
    pub authentication: Endpoint,
    pub ticket_granting: Endpoint,
    pub service: Endpoint,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            bootstrap_authentication: Endpoint::local(5521),
            bootstrap_ticket_granting: Endpoint::local(5501),
            authentication: Endpoint::local(1121),
            ticket_granting: Endpoint::local(1202),
            service: Endpoint::local(1203),
        }
    }
}

/// Upper bound for every window: one week.
pub const MAX_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

/// Validity windows, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Windows {
    /// Longest granting-ticket lifetime the AS issues.
    pub grant_secs: i64,
    /// Longest service-ticket lifetime the TGS issues.
    pub service_secs: i64,
    /// Tolerated distance between an authenticator's timestamp and now.
    pub skew_secs: i64,
    /// Lifetime the client asks the AS for.
    pub requested_secs: i64,
}

impl Default for Windows {
    fn default() -> Self {
        Self { grant_secs: 300, service_secs: 300, skew_secs: 300, requested_secs: 300 }
    }
}

fn window(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(0, MAX_WINDOW_SECS))
}

impl Windows {
    pub fn grant(&self) -> Duration {
        window(self.grant_secs)
    }

    pub fn service(&self) -> Duration {
        window(self.service_secs)
    }

    pub fn skew(&self) -> Duration {
        window(self.skew_secs)
    }

    pub fn requested(&self) -> Duration {
        window(self.requested_secs)
    }
}

/// Top-level realm configuration, shared by every role process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    pub identities: Identities,
    pub endpoints: Endpoints,
    pub windows: Windows,
    pub key_dir: PathBuf,
    /// Subject marker the service puts in its approval ticket.
    pub approval_marker: String,
    /// Address the client claims in authenticators; defaults to the local
    /// address of its connection to the AS.
    pub client_address: Option<IpAddr>,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            identities: Identities::default(),
            endpoints: Endpoints::default(),
            windows: Windows::default(),
            key_dir: PathBuf::from("keys"),
            approval_marker: "ServiceAuth".to_string(),
            client_address: None,
        }
    }
}

impl RealmConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.to_path_buf(), source },
            other => other,
        })
    }

    /// Like [`RealmConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: PathBuf::new(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ids = &self.identities;
        let names = [&ids.client, &ids.authentication, &ids.ticket_granting, &ids.service];
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::Invalid("role identities must not be empty".into()));
            }
            if names[..i].contains(name) {
                return Err(ConfigError::Invalid(format!("identity `{name}` used by two roles")));
            }
        }
        let w = &self.windows;
        if w.grant_secs <= 0 || w.service_secs <= 0 || w.requested_secs <= 0 {
            return Err(ConfigError::Invalid("ticket windows must be positive".into()));
        }
        if w.skew_secs < 0 {
            return Err(ConfigError::Invalid("skew window must not be negative".into()));
        }
        let longest = [w.grant_secs, w.service_secs, w.skew_secs, w.requested_secs].into_iter().max().unwrap_or(0);
        if longest > MAX_WINDOW_SECS {
            return Err(ConfigError::Invalid(format!(
                "window of {longest}s exceeds the {MAX_WINDOW_SECS}s limit"
            )));
        }
        if self.approval_marker.is_empty() {
            return Err(ConfigError::Invalid("approval marker must not be empty".into()));
        }
        Ok(())
    }
}
