//! Typed configuration loaded from a file via the `config` crate.

use std::boxed::Box;
use std::fs;
use std::io::BufReader;

use config::{Config, ConfigError};

use rustls::{internal::pemfile::certs, Certificate};

/// Where the metrics text endpoint listens.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub port: u16,
    pub addr: String,
}

/// Configuration for an NTS-KE server instance.
#[derive(Clone, Debug)]
pub struct KeServerConfig {
    /// Addresses to bind the NTS-KE TLS listener on (each `host:port`).
    pub addrs: Vec<String>,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    /// NTP port to advertise via an `NTPv4-Port` record, if it differs from 123.
    pub ntp_port: Option<u16>,
    /// NTP server hostname to advertise via an `NTPv4-Server` record, if set.
    pub ntp_server: Option<String>,
    pub metrics: Option<MetricsConfig>,
}

/// Configuration for an NTS-NTP server instance.
#[derive(Clone, Debug)]
pub struct NtpServerConfig {
    pub addrs: Vec<String>,
    pub metrics: Option<MetricsConfig>,
    pub upstream_addr: Option<(String, u16)>,
}

/// Configuration for an NTS client run (KE host plus optional overrides).
#[derive(Clone, Debug)]
pub struct NtsClientConfig {
    pub host: String,
    pub port: Option<String>,
    pub trusted_cert: Option<Certificate>,
    pub use_ipv4: Option<bool>,
}

fn io_to_config(cause: std::io::Error) -> ConfigError {
    ConfigError::Foreign(Box::new(cause))
}

pub fn load_tls_certs(path: String) -> Result<Vec<Certificate>, ConfigError> {
    certs(&mut BufReader::new(
        fs::File::open(&path).map_err(io_to_config)?,
    ))
    .map_err(|()| ConfigError::Message(format!("could not load certificate from {}", &path)))
}

fn get_metrics_config(settings: &Config) -> Option<MetricsConfig> {
    let addr = settings.get_str("metrics_addr").ok()?;
    let port = settings.get_int("metrics_port").ok()?;
    Some(MetricsConfig {
        port: port as u16,
        addr,
    })
}

fn to_string(values: Vec<config::Value>) -> Vec<String> {
    values.into_iter().map(|v| v.into_str().unwrap()).collect()
}

/// Load configuration for an NTS-KE server from `config_filename`.
pub fn parse_ke_server_config(config_filename: &str) -> Result<KeServerConfig, ConfigError> {
    let mut settings = Config::default();
    settings.merge(config::File::with_name(config_filename))?;

    let config = KeServerConfig {
        addrs: settings.get_array("addr").map(to_string)?,
        tls_cert_file: settings.get_str("tls_cert_file")?,
        tls_key_file: settings.get_str("tls_key_file")?,
        ntp_port: settings.get_int("ntp_port").ok().map(|p| p as u16),
        ntp_server: settings.get_str("ntp_server").ok(),
        metrics: get_metrics_config(&settings),
    };
    Ok(config)
}

/// Load configuration for an NTS-NTP server from `config_filename`.
///
/// All paths MUST be given relative to the directory the server is run from.
pub fn parse_ntp_server_config(config_filename: &str) -> Result<NtpServerConfig, ConfigError> {
    let mut settings = Config::default();
    settings.merge(config::File::with_name(config_filename))?;

    let config = NtpServerConfig {
        addrs: settings.get_array("addr").map(to_string)?,
        metrics: get_metrics_config(&settings),
        upstream_addr: {
            match settings.get_str("upstream_host") {
                Ok(host) => match settings.get_int("upstream_port") {
                    Ok(port) => Some((host, port as u16)),
                    Err(_) => None,
                },
                Err(_) => None,
            }
        },
    };
    Ok(config)
}
