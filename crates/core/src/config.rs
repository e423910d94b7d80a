//! driver-wide tunables: the default scan period, connect/scan timeouts, the MultiRequest
//! packing limit, and the verbosity level that `ab-eip-log` maps onto `log::LevelFilter`.

use std::time::Duration;

/// verbosity scale from 0 (silent) to 10 (full packet hex dumps), per spec.md §6
pub type VerbosityLevel = u8;

/// driver-wide configuration, supplied once when the registry is initialized
#[derive(Debug, Clone)]
pub struct Config {
    /// period consulted when a caller doesn't specify one to `add_tag`
    pub default_period: Duration,
    /// deadline for the initial TCP connect and EtherNet/IP handshake
    pub connect_timeout: Duration,
    /// per-I/O-call deadline once a session is established; also the reconnect backoff
    pub scan_timeout: Duration,
    /// max combined request/response byte size the worker will pack into one transfer
    pub transfer_buffer_limit: usize,
    /// 0..=10, see [`VerbosityLevel`]
    pub verbosity: VerbosityLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_period: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(5),
            transfer_buffer_limit: 500,
            verbosity: 2,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// builder for [`Config`]; unset fields keep [`Config::default`]'s values
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    default_period: Option<Duration>,
    connect_timeout: Option<Duration>,
    scan_timeout: Option<Duration>,
    transfer_buffer_limit: Option<usize>,
    verbosity: Option<VerbosityLevel>,
}

impl ConfigBuilder {
    pub fn default_period(mut self, period: Duration) -> Self {
        self.default_period = Some(period);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = Some(timeout);
        self
    }

    pub fn transfer_buffer_limit(mut self, limit: usize) -> Self {
        self.transfer_buffer_limit = Some(limit);
        self
    }

    pub fn verbosity(mut self, level: VerbosityLevel) -> Self {
        self.verbosity = Some(level.min(10));
        self
    }

    pub fn build(self) -> Config {
        let default = Config::default();
        Config {
            default_period: self.default_period.unwrap_or(default.default_period),
            connect_timeout: self.connect_timeout.unwrap_or(default.connect_timeout),
            scan_timeout: self.scan_timeout.unwrap_or(default.scan_timeout),
            transfer_buffer_limit: self
                .transfer_buffer_limit
                .unwrap_or(default.transfer_buffer_limit),
            verbosity: self.verbosity.unwrap_or(default.verbosity),
        }
    }
}
