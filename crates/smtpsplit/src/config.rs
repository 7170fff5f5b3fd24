use crate::routing::{RoutingError, RoutingTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("listen_address is required")]
    MissingListenAddress,
    #[error("timeout_seconds is required")]
    MissingTimeout,
    #[error("timeout_seconds must be greater than zero")]
    ZeroTimeout,
    #[error("routes is required")]
    MissingRoutes,
    #[error("invalid routes: {0}")]
    Routing(#[from] RoutingError),
    #[error("certificate is set but certificate_key is not")]
    CertificateWithoutKey,
    #[error("certificate_key is set but certificate is not")]
    KeyWithoutCertificate,
    #[error("host was not set and the machine host name is not valid UTF-8")]
    Hostname,
}

/// The file as written by the operator; everything is optional here
/// so that a missing field is reported as such rather than as a
/// generic parse failure.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    listen_address: Option<String>,
    host: Option<String>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    debug: bool,
    certificate: Option<PathBuf>,
    certificate_key: Option<PathBuf>,
    routes: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsFiles {
    pub certificate: PathBuf,
    pub certificate_key: PathBuf,
}

/// Validated, immutable process configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub listen_address: String,
    /// Advertised in the inbound greeting and sent in outbound HELO
    pub host: String,
    pub timeout_seconds: u64,
    pub debug: bool,
    #[serde(flatten)]
    pub tls: Option<TlsFiles>,
    pub routes: RoutingTable,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw, default_hostname)
    }

    fn from_raw(
        raw: RawConfig,
        hostname: impl FnOnce() -> Result<String, ConfigError>,
    ) -> Result<Self, ConfigError> {
        let listen_address = raw
            .listen_address
            .filter(|addr| !addr.is_empty())
            .ok_or(ConfigError::MissingListenAddress)?;

        let timeout_seconds = raw.timeout_seconds.ok_or(ConfigError::MissingTimeout)?;
        if timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        let routes = RoutingTable::new(raw.routes.ok_or(ConfigError::MissingRoutes)?)?;

        let tls = match (raw.certificate, raw.certificate_key) {
            (Some(certificate), Some(certificate_key)) => Some(TlsFiles {
                certificate,
                certificate_key,
            }),
            (Some(_), None) => return Err(ConfigError::CertificateWithoutKey),
            (None, Some(_)) => return Err(ConfigError::KeyWithoutCertificate),
            (None, None) => None,
        };

        let host = match raw.host.filter(|h| !h.is_empty()) {
            Some(host) => host,
            None => hostname()?,
        };

        Ok(Self {
            listen_address,
            host,
            timeout_seconds,
            debug: raw.debug,
            tls,
            routes,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn log_summary(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => tracing::info!("Using configuration: {json}"),
            Err(err) => tracing::error!("unable to serialize configuration: {err:#}"),
        }
    }
}

fn default_hostname() -> Result<String, ConfigError> {
    gethostname::gethostname()
        .into_string()
        .map_err(|_| ConfigError::Hostname)
}
