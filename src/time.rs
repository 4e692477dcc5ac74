//! Time helpers: Modified Julian Date conversion and the heartbeat string.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;

/// 1970-01-01 expressed as an integer MJD.
const MJD_UNIX_EPOCH: u64 = 40587;

pub const SECS_PER_DAY: u64 = 86400;

/// A Modified Julian Date split into integer day, integer second of day and
/// fractional second, the way GUPPI headers carry an observation start time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mjd {
    pub imjd: u64,
    pub smjd: u64,
    pub offs: f64,
}

/// Convert seconds since the unix epoch to an MJD triple.
pub fn mjd_from_unix(secs: f64) -> Mjd {
    let whole = secs.floor().max(0.0) as u64;
    let offs = (secs - secs.floor()).clamp(0.0, 1.0);
    Mjd {
        imjd: MJD_UNIX_EPOCH + whole / SECS_PER_DAY,
        smjd: whole % SECS_PER_DAY,
        offs,
    }
}

/// Current unix time as floating-point seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Human-readable UTC timestamp for the DAQPULSE heartbeat.
pub fn heartbeat() -> String {
    Utc::now().format("%a %b %e %H:%M:%S %Y").to_string()
}
