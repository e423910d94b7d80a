//! EtherNet/IP session + CIP request/response engine, and the scan-loop scheduler, for
//! Allen-Bradley ControlLogix PLCs.
//!
//! The public surface is [`registry::Registry`] (a process-wide singleton, see
//! [`registry::Registry::global`]) together with the free functions [`registry::read_value`]
//! and [`registry::schedule_write`] that operate on a [`tag::TagHandle`].

pub mod cip;
pub mod codec;
pub mod config;
pub mod connection;
pub mod encap;
pub mod error;
pub mod plc;
pub mod registry;
pub mod tag;
pub mod tag_path;
pub mod worker;

pub use config::{Config, ConfigBuilder, VerbosityLevel};
pub use error::{Error, Result};
pub use plc::{Identity, Plc};
pub use registry::{read_value, schedule_write, PlcHandle, Registry};
pub use tag::{Callback, CallbackEvent, TagHandle, TagInfo};
pub use tag_path::{ParsedTag, Segment};
