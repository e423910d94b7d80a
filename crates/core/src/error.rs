//! error kinds produced by the session/CIP engine and the scan worker

use std::io;

/// result type used throughout this crate
pub type Result<T> = std::result::Result<T, Error>;

/// everything that can go wrong talking to a ControlLogix controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// a symbolic tag string did not match the `name ('.' name | '[' uint32 ']')*` grammar
    #[error("invalid tag syntax: {0}")]
    Parse(String),

    /// the configured address could not be resolved to a socket address
    #[error("could not resolve address {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// the TCP connect (or the non-blocking wait for it) failed
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// ListServices didn't advertise CIP support, or RegisterSession was rejected
    #[error("EtherNet/IP handshake failed: {0}")]
    Handshake(String),

    /// an I/O deadline was exceeded
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// a frame or response was malformed: wrong command, wrong session, bad offsets, ...
    #[error("protocol error: {0}")]
    Protocol(String),

    /// the controller's Message Router returned a non-zero general status
    #[error("CIP status 0x{status:02X}{}", ext_status_suffix(*ext_status))]
    CipStatus {
        status: u8,
        ext_status: Option<u16>,
    },

    /// a buffer grow was refused (would exceed a sane cap)
    #[error("buffer grow to {requested} bytes refused")]
    Alloc { requested: usize },

    /// the tag data lock could not be acquired within its short timeout; treat as a transient miss
    #[error("would stall acquiring tag lock for {tag}")]
    WouldStall { tag: String },

    /// a lower-level I/O error not covered by a more specific variant above
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn ext_status_suffix(ext: Option<u16>) -> String {
    match ext {
        Some(e) => format!(" (ext 0x{:04X})", e),
        None => String::new(),
    }
}

impl Error {
    /// well-known CIP general status codes named in the spec, for callers that want to
    /// distinguish "tag doesn't exist" from "transient" without matching on raw numbers
    pub fn cip_status_meaning(status: u8) -> Option<&'static str> {
        Some(match status {
            0x04 => "unknown tag / path error",
            0x05 => "instance not found",
            0x06 => "partial data",
            0x08 => "service not supported",
            0x09 => "invalid attribute",
            0x13 => "not enough data",
            0x14 => "attribute not supported",
            0x15 => "too much data",
            0x1E => "one of the multi-request sub-responses failed",
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cip_status_display_includes_ext() {
        let e = Error::CipStatus {
            status: 0x04,
            ext_status: Some(0x0002),
        };
        let msg = e.to_string();
        assert!(msg.contains("0x04"));
        assert!(msg.contains("0x0002"));
    }

    #[test]
    fn cip_status_display_without_ext() {
        let e = Error::CipStatus {
            status: 0x1E,
            ext_status: None,
        };
        assert_eq!(e.to_string(), "CIP status 0x1E");
    }

    #[test]
    fn known_status_meanings() {
        assert_eq!(
            Error::cip_status_meaning(0x04),
            Some("unknown tag / path error")
        );
        assert_eq!(Error::cip_status_meaning(0xFF), None);
    }
}
