use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Settings applied to every connection, accepted or opened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of each received/sent subscription. A subscriber this far
    /// behind holds the connection back until it catches up.
    pub event_capacity: usize,
    /// Optional ceiling on the decoded payload length. `None` accepts any
    /// length the prefix can express.
    pub max_payload_size: Option<u32>,
    /// Optional bound on packets waiting to be written. `None` queues without
    /// limit; when set, writes beyond it are rejected.
    pub write_queue_capacity: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            event_capacity: 1024,
            max_payload_size: None,
            write_queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ip: String,
    pub port: u16,
    /// Capacity of the connected notification channel.
    pub event_capacity: usize,
    /// First delay after a faulted accept; doubles on each consecutive fault.
    pub accept_backoff_ms: u64,
    pub max_accept_backoff_ms: u64,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "127.0.0.1".to_string(),
            port: 9300,
            event_capacity: 1024,
            accept_backoff_ms: 10,
            max_accept_backoff_ms: 1000,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> AppResult<SocketAddr> {
        let listen_address = format!("{}:{}", self.ip, self.port);
        listen_address.parse().map_err(|err| {
            AppError::InvalidValue(format!("listen address {}: {}", listen_address, err))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for the hourly rolling log file.
    pub dir: String,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: "logs".to_string(),
            file_prefix: "packetwire.log".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PacketwireConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
}

impl PacketwireConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<PacketwireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let packetwire_config: PacketwireConfig = config.try_deserialize()?;
        Ok(packetwire_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_load_config_from_toml() -> AppResult<()> {
        let mut file = Builder::new().suffix(".toml").tempfile()?;
        writeln!(
            file,
            r#"
[server]
ip = "0.0.0.0"
port = 7000
accept_backoff_ms = 5

[server.connection]
event_capacity = 16
max_payload_size = 65536
write_queue_capacity = 64

[log]
dir = "/tmp/packetwire"
"#
        )?;

        let config = PacketwireConfig::set_up_config(file.path())?;
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.accept_backoff_ms, 5);
        assert_eq!(config.server.max_accept_backoff_ms, 1000);
        assert_eq!(config.server.connection.event_capacity, 16);
        assert_eq!(config.server.connection.max_payload_size, Some(65536));
        assert_eq!(config.server.connection.write_queue_capacity, Some(64));
        assert_eq!(config.log.dir, "/tmp/packetwire");
        assert_eq!(config.log.file_prefix, "packetwire.log");
        assert_eq!(
            config.server.socket_addr()?,
            "0.0.0.0:7000".parse::<SocketAddr>().unwrap()
        );
        Ok(())
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = PacketwireConfig::set_up_config("/nonexistent/packetwire.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }

    #[test]
    fn test_invalid_listen_address() {
        let config = ServerConfig {
            ip: "not-an-ip".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(config.socket_addr(), Err(AppError::InvalidValue(_))));
    }
}
