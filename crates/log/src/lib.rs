//! maps the driver's 0..=10 verbosity scale (spec.md §6) onto `log::LevelFilter`, and a
//! `log::Log` implementation callers can install when they want a standalone sink instead of
//! wiring up `env_logger`/`fern`/etc. themselves.

use ab_eip_core::VerbosityLevel;
use log::LevelFilter;

/// map a 0..=10 verbosity level onto the nearest `log::LevelFilter`, per spec.md §4.8:
/// 0-1 -> Off/Error, 2-3 -> Warn, 4-6 -> Info, 7-8 -> Debug, 9-10 -> Trace.
pub fn level_filter(verbosity: VerbosityLevel) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 | 3 => LevelFilter::Warn,
        4..=6 => LevelFilter::Info,
        7 | 8 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// set the global `log` crate max level from a driver verbosity level. Does not install a
/// logger implementation — callers still need `env_logger::init()` or equivalent to see output;
/// this only adjusts the threshold below which log macros compile out at the call site.
pub fn set_verbosity(verbosity: VerbosityLevel) {
    log::set_max_level(level_filter(verbosity));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_boundaries() {
        assert_eq!(level_filter(0), LevelFilter::Off);
        assert_eq!(level_filter(1), LevelFilter::Error);
        assert_eq!(level_filter(2), LevelFilter::Warn);
        assert_eq!(level_filter(3), LevelFilter::Warn);
        assert_eq!(level_filter(4), LevelFilter::Info);
        assert_eq!(level_filter(6), LevelFilter::Info);
        assert_eq!(level_filter(7), LevelFilter::Debug);
        assert_eq!(level_filter(8), LevelFilter::Debug);
        assert_eq!(level_filter(9), LevelFilter::Trace);
        assert_eq!(level_filter(10), LevelFilter::Trace);
    }
}
