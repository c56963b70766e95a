//! Process configuration, consumed once at startup.

use std::path::PathBuf;

use clap::Parser;

use crate::{Error, TriggerMode};

/// Command line configuration of the server.
#[derive(Parser, Debug, Clone)]
#[command(name = "skiff", about = "Single-reactor, thread-pool HTTP/1.1 static file server")]
pub struct Config {
    /// Listen port (non-privileged range only).
    #[arg(short, long, default_value_t = 1316)]
    pub port: u16,

    /// Trigger mode: 0 = LT/LT, 1 = LT/ET, 2 = ET/LT, 3 = ET/ET
    /// (listen socket / connection sockets).
    #[arg(short = 'm', long, default_value_t = 3)]
    pub trigger_mode: u8,

    /// Idle-connection timeout in milliseconds; 0 disables expiry.
    #[arg(short = 't', long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    /// Set SO_LINGER on the listen socket.
    #[arg(long)]
    pub linger: bool,

    /// Document root; relative paths resolve against the working directory.
    #[arg(long, default_value = "resources")]
    pub root: PathBuf,

    /// Connection cap; the listener answers "Server busy!" beyond it.
    #[arg(long, default_value_t = 65_536)]
    pub max_connections: usize,

    /// Worker threads in the pool.
    #[arg(long, default_value_t = 8)]
    pub threads: usize,

    /// Backend database host.
    #[arg(long, default_value = "localhost")]
    pub db_host: String,

    /// Backend database port.
    #[arg(long, default_value_t = 3306)]
    pub db_port: u16,

    /// Backend database account.
    #[arg(long, default_value = "root")]
    pub db_user: String,

    /// Backend database password.
    #[arg(long, default_value = "")]
    pub db_password: String,

    /// Backend database name.
    #[arg(long, default_value = "webserver")]
    pub db_name: String,

    /// Backend handles to pool; 0 runs without a backend pool.
    #[arg(long, default_value_t = 12)]
    pub db_conns: usize,

    /// Disable the log sink entirely.
    #[arg(long)]
    pub no_log: bool,

    /// Log level: 0 = debug, 1 = info, 2 = warn, 3 = error.
    #[arg(long, default_value_t = 1)]
    pub log_level: u8,

    /// Async log queue capacity; 0 selects synchronous logging.
    #[arg(long, default_value_t = 1024)]
    pub log_queue: usize,

    /// Directory for log files, created when missing.
    #[arg(long, default_value = "log")]
    pub log_dir: PathBuf,
}

impl Config {
    /// Rejects ports outside the non-privileged range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.port < 1024 {
            return Err(Error::Port(self.port));
        }
        Ok(())
    }

    /// The configured trigger mode pair.
    pub fn trigger(&self) -> TriggerMode {
        TriggerMode::from_mode(self.trigger_mode)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 1316,
            trigger_mode: 3,
            timeout_ms: 60_000,
            linger: false,
            root: PathBuf::from("resources"),
            max_connections: 65_536,
            threads: 8,
            db_host: "localhost".to_string(),
            db_port: 3306,
            db_user: "root".to_string(),
            db_password: String::new(),
            db_name: "webserver".to_string(),
            db_conns: 12,
            no_log: false,
            log_level: 1,
            log_queue: 1024,
            log_dir: PathBuf::from("log"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;
    use crate::TriggerMode;

    #[test]
    fn default_config_is_fully_edge_triggered() {
        let config = Config::default();
        assert_eq!(TriggerMode::EtEt, config.trigger());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn privileged_ports_fail_validation() {
        let config = Config {
            port: 80,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn trigger_mode_mapping_covers_all_pairs() {
        assert_eq!(TriggerMode::LtLt, TriggerMode::from_mode(0));
        assert_eq!(TriggerMode::LtEt, TriggerMode::from_mode(1));
        assert_eq!(TriggerMode::EtLt, TriggerMode::from_mode(2));
        assert_eq!(TriggerMode::EtEt, TriggerMode::from_mode(3));
        assert_eq!(TriggerMode::EtEt, TriggerMode::from_mode(42));

        assert!(!TriggerMode::LtEt.listen_et());
        assert!(TriggerMode::LtEt.conn_et());
        assert!(TriggerMode::EtLt.listen_et());
        assert!(!TriggerMode::EtLt.conn_et());
    }
}
