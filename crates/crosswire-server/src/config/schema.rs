use serde::Deserialize;

use crosswire_core::error::{Error, Result};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub version: u32,

    #[serde(default)]
    pub tcp: TcpSection,

    #[serde(default)]
    pub ws: WsSection,

    #[serde(default)]
    pub connection: ConnectionSection,

    #[serde(default)]
    pub heartbeat: HeartbeatSection,

    #[serde(default)]
    pub workers: WorkerSection,

    #[serde(default)]
    pub timer: TimerSection,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(Error::Config(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        self.connection.validate()?;
        self.heartbeat.validate()?;
        self.workers.validate()?;
        self.timer.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TcpSection {
    #[serde(default = "default_tcp_listen")]
    pub listen: String,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            listen: default_tcp_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WsSection {
    #[serde(default = "default_ws_listen")]
    pub listen: String,
}

impl Default for WsSection {
    fn default() -> Self {
        Self {
            listen: default_ws_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionSection {
    /// Bounded outbound queue per connection; a full queue fails writes
    /// synchronously instead of blocking.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl ConnectionSection {
    pub fn validate(&self) -> Result<()> {
        if !(16..=65536).contains(&self.outbound_queue) {
            return Err(Error::Config(
                "connection.outbound_queue must be between 16 and 65536".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_heartbeat_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_ms(),
            idle_timeout_ms: default_heartbeat_ms(),
        }
    }
}

impl HeartbeatSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=600_000).contains(&self.interval_ms) {
            return Err(Error::Config(
                "heartbeat.interval_ms must be between 100 and 600000".into(),
            ));
        }
        if self.idle_timeout_ms < self.interval_ms {
            return Err(Error::Config(
                "heartbeat.idle_timeout_ms must not be less than interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    #[serde(default = "default_worker_queue")]
    pub queue: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue: default_worker_queue(),
        }
    }
}

impl WorkerSection {
    pub fn validate(&self) -> Result<()> {
        if !(1..=1024).contains(&self.count) {
            return Err(Error::Config(
                "workers.count must be between 1 and 1024".into(),
            ));
        }
        if !(1..=65536).contains(&self.queue) {
            return Err(Error::Config(
                "workers.queue must be between 1 and 65536".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerSection {
    #[serde(default = "default_timer_tick_ms")]
    pub tick_ms: u64,
}

impl Default for TimerSection {
    fn default() -> Self {
        Self {
            tick_ms: default_timer_tick_ms(),
        }
    }
}

impl TimerSection {
    pub fn validate(&self) -> Result<()> {
        if !(10..=10_000).contains(&self.tick_ms) {
            return Err(Error::Config(
                "timer.tick_ms must be between 10 and 10000".into(),
            ));
        }
        Ok(())
    }
}

fn default_tcp_listen() -> String {
    "0.0.0.0:7600".into()
}
fn default_ws_listen() -> String {
    "0.0.0.0:7601".into()
}
fn default_outbound_queue() -> usize {
    1024
}
fn default_heartbeat_ms() -> u64 {
    60_000
}
fn default_worker_count() -> usize {
    8
}
fn default_worker_queue() -> usize {
    1024
}
fn default_timer_tick_ms() -> u64 {
    500
}
