//! Scans symbolic tags on Allen-Bradley ControlLogix PLCs over EtherNet/IP (CIP) and hands
//! values to upstream consumers through a callback interface.
//!
//! This crate is a thin facade: [`ab_eip_core`] holds the session/CIP engine and scan worker,
//! re-exported here under the module names below. The `async` feature adds [`r#async`], an
//! optional `tokio`-based facade for callers who'd rather `.await` than register a callback; the
//! `log` feature adds [`log_bridge`], a verbosity-level bridge to the `log` facade.
//!
//! ```no_run
//! use ab_eip::{Config, Registry};
//! use std::time::Duration;
//!
//! let registry = Registry::init(Config::default());
//! let plc = registry.define_plc("line1", "192.168.1.10", 0);
//! let tag = registry.add_tag(&plc, Duration::from_secs(1), "Recipe.Count", 1).unwrap();
//! registry.restart();
//! ```

pub use ab_eip_core::*;

#[cfg(feature = "async")]
pub use ab_eip_async as r#async;

#[cfg(feature = "log")]
pub use ab_eip_log as log_bridge;
