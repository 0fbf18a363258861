//! Configuration management

use crate::delivery::DeliveryMode;
use crate::{is_reserved_port, DEFAULT_TLS_PORT, DEFAULT_UDP_PORT};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel configuration
    pub tunnel: TunnelConfig,
    /// Certificates and keys
    pub tls: TlsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values that would only fail later at bind or dial time
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.tunnel.listen_ip()?;

        for (name, port) in [
            ("udp_port", self.tunnel.udp_port),
            ("tls_port", self.tunnel.tls_port),
            ("remote_tls_port", self.tunnel.remote_tls_port),
        ] {
            if is_reserved_port(port) {
                return Err(crate::Error::Config(format!(
                    "{} {} is reserved",
                    name, port
                )));
            }
        }

        if self.tunnel.cooldown_secs == 0 {
            return Err(crate::Error::Config(
                "cooldown_secs must be greater than zero".to_string(),
            ));
        }
        if self.tunnel.connect_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.tunnel.write_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "write_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Address both pumps bind to
    pub listen_addr: String,
    /// Local UDP ingress port
    pub udp_port: u16,
    /// Local TLS ingress port
    pub tls_port: u16,
    /// Port dialed on remote peers
    pub remote_tls_port: u16,
    /// Seconds to refuse redials after a failed dial
    pub cooldown_secs: u64,
    /// TCP connect and TLS handshake timeout
    pub connect_timeout_secs: u64,
    /// Deadline for writing one frame to a tunnel connection
    pub write_timeout_secs: u64,
    /// Append a send timestamp to every frame and trace latency on receipt.
    /// Both ends must agree.
    pub net_profiling: bool,
    /// Log per-flow packet counters
    pub forward_stats: bool,
    /// Local delivery backend
    pub delivery: DeliveryMode,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            tls_port: DEFAULT_TLS_PORT,
            remote_tls_port: DEFAULT_TLS_PORT,
            cooldown_secs: 10,
            connect_timeout_secs: 30,
            write_timeout_secs: 60,
            net_profiling: false,
            forward_stats: false,
            delivery: DeliveryMode::Auto,
        }
    }
}

impl TunnelConfig {
    /// Parsed listen address; empty means all interfaces
    pub fn listen_ip(&self) -> Result<IpAddr, crate::Error> {
        if self.listen_addr.is_empty() {
            return Ok(IpAddr::from([0, 0, 0, 0]));
        }
        self.listen_addr.parse().map_err(|e| {
            crate::Error::Config(format!("Invalid listen_addr {:?}: {}", self.listen_addr, e))
        })
    }
}

/// TLS certificate and key paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain presented to peers
    pub cert_path: String,
    /// PEM private key
    pub key_path: String,
    /// PEM CA certificate(s) peers must chain to
    pub ca_cert_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "/etc/udp_rx/cert.pem".to_string(),
            key_path: "/etc/udp_rx/key.pem".to_string(),
            ca_cert_path: "/etc/udp_rx/ca.pem".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error, or 0/1/2)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Filter directive for `level`, mapping numeric levels 0/1/2 to warn/info/debug
    pub fn filter_directive(&self) -> &str {
        level_directive(&self.level)
    }
}

/// Map numeric verbosity levels onto tracing levels, passing others through
pub fn level_directive(level: &str) -> &str {
    match level {
        "0" => "warn",
        "1" => "info",
        "2" => "debug",
        other => other,
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tunnel.udp_port, 55555);
        assert_eq!(config.tunnel.tls_port, 55554);
        assert_eq!(config.tunnel.remote_tls_port, 55554);
        assert_eq!(config.tunnel.cooldown_secs, 10);
        assert_eq!(config.tunnel.delivery, DeliveryMode::Auto);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[tunnel]\nlisten_addr = \"10.0.0.1\"\nnet_profiling = true\n\n\
             [tls]\ncert_path = \"/tmp/c.pem\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.tunnel.listen_addr, "10.0.0.1");
        assert!(config.tunnel.net_profiling);
        assert_eq!(config.tunnel.udp_port, 55555);
        assert_eq!(config.tls.cert_path, "/tmp/c.pem");
        assert_eq!(config.tls.key_path, "/etc/udp_rx/key.pem");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.toml");

        let mut config = generate_example_config();
        config.tunnel.udp_port = 45555;
        config.tunnel.delivery = DeliveryMode::Socket;
        config.logging.file = Some("/var/log/tunnel.log".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tunnel.udp_port, 45555);
        assert_eq!(loaded.tunnel.delivery, DeliveryMode::Socket);
        assert_eq!(loaded.logging.file.as_deref(), Some("/var/log/tunnel.log"));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.tunnel.udp_port = 1023;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.remote_tls_port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.cooldown_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.write_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.listen_addr = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel.listen_addr = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_numeric_levels() {
        assert_eq!(level_directive("0"), "warn");
        assert_eq!(level_directive("2"), "debug");
        assert_eq!(level_directive("trace"), "trace");
    }
}
