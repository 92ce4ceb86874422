// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub discovery: Discovery,
    pub broker: Broker,
    pub http: Http,
    pub session: Session,
    pub log: Log,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    /// Broadcast address to send the `M99999` probe to.
    pub broadcast_addr: String,
    /// How long to collect datagrams after sending a broadcast probe.
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    /// Address the embedded MQTT broker listens on; port 0 picks an
    /// ephemeral port, read back via the bound `TcpListener`.
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Http {
    /// Address the trivial file server listens on.
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    /// Overall wait for a correlated command response.
    pub command_timeout_ms: u64,
    /// Number of status snapshots to observe while waiting for a print to
    /// start before declaring the `print()` workflow failed.
    pub print_start_window: usize,
    /// Whether a non-zero `Ack` in a response aborts the session by
    /// default.
    pub abort_on_bad_ack: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    pub console_log: bool,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::Error,
            LogLevel::Warn => Self::Warn,
            LogLevel::Info => Self::Info,
            LogLevel::Debug => Self::Debug,
            LogLevel::Trace => Self::Trace,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery: Discovery {
                broadcast_addr: "255.255.255.255:3000".to_string(),
                probe_timeout_ms: 1000,
            },
            broker: Broker {
                bind_addr: "0.0.0.0:0".to_string(),
            },
            http: Http {
                bind_addr: "0.0.0.0:0".to_string(),
            },
            session: Session {
                command_timeout_ms: 5000,
                print_start_window: 5,
                abort_on_bad_ack: true,
            },
            log: Log {
                console_log: true,
                level: LogLevel::Info,
            },
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// Returns error if `s` is not well-formed TOML matching this shape.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
