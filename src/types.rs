use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

/// Calibration constant: km/h per RPM, as used by the vendor app
///
/// `speed_kmh = rpm * 55 * 0.00478536`. Reverse-engineered; reproduced
/// exactly for output compatibility.
pub const SPEED_KMH_PER_RPM: f64 = 55.0 * 0.004_785_36;

/// The raw distance counter wraps back to 0 after reaching this many counts
pub const DISTANCE_COUNTER_MODULUS: u32 = 1000;

/// Session lifecycle phase, governing which operations are legal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// No socket; `connect` is the only legal operation
    Disconnected,
    /// Socket open, handshake not yet completed
    Initializing,
    /// Handshake done, sport mode paused
    Idle,
    /// Sport mode running, telemetry flowing
    Sporting,
    /// Session lost to an I/O failure or liveness saturation; reconnect required
    Error,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Idle => write!(f, "Idle"),
            Self::Sporting => write!(f, "Sporting"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Device identity reported during the initialization handshake
///
/// Immutable once the handshake completes; a reconnect repopulates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Lowest selectable resistance level (display numbering, usually 1)
    pub resistance_min: u8,
    /// Highest selectable resistance level (display numbering)
    pub resistance_max: u8,
    /// Flywheel diameter in inches, from the `ED` frame (value ×100 on the wire)
    pub wheel_diameter_in: f64,
    /// Device MAC address, stored verbatim as the hex text the bike sent
    pub mac_address: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            resistance_min: 0,
            resistance_max: 0,
            wheel_diameter_in: crate::DEFAULT_WHEEL_DIAMETER_IN,
            mac_address: String::new(),
        }
    }
}

/// Field ordering of the sport-data record
///
/// The protocol documentation shows two inconsistent orderings. Which one a
/// unit speaks depends on its firmware; it must be configured, never guessed,
/// because both layouts are plausible-looking digit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SportFrameLayout {
    /// `SYNC,DISTANCE,RPM,PULSE,LEVEL,CALORIES,POWER,RESERVED` — the layout
    /// confirmed against vendor-app captures; the default
    #[default]
    DistanceFirst,
    /// `SYNC,POWER,PULSE,LEVEL,DISTANCE,RPM` — alternate ordering some
    /// firmware revisions document; carries no calorie field
    PowerFirst,
}

/// Latest decoded telemetry, published atomically on each successful poll
///
/// External readers always receive a value copy, never a live reference, so
/// the session can keep mutating its working state without readers observing
/// partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportSnapshot {
    /// Rolling single-digit counter from the bike
    ///
    /// A repeated value is not dropped: every poll is its own
    /// request/response exchange with stale pending frames discarded before
    /// the request, so a repeat means the bike re-reported unchanged
    /// telemetry, not that an old frame was read twice. The counter is
    /// surfaced for readers that want to collapse such repeats themselves.
    pub sync_counter: u8,
    /// Distance counter exactly as reported this poll (0..999)
    pub raw_distance: u16,
    /// How many times the raw counter has wrapped since session start/clear
    pub wrap_count: u32,
    /// Cumulative distance in kilometres, wrap-corrected
    pub distance_km: f64,
    /// Cadence in revolutions per minute
    pub rpm: u16,
    /// Heart rate in beats per minute (0 when no sensor is paired)
    pub heart_rate_bpm: u16,
    /// Current resistance level (display numbering)
    pub level: u8,
    /// Estimated burned calories in kcal
    pub calories_kcal: f64,
    /// Output power in watts
    pub power_watts: u16,
    /// Speed in km/h, derived from cadence
    pub speed_kmh: f64,
    /// When this snapshot was decoded
    pub timestamp: SystemTime,
}

impl Default for SportSnapshot {
    fn default() -> Self {
        Self {
            sync_counter: 0,
            raw_distance: 0,
            wrap_count: 0,
            distance_km: 0.0,
            rpm: 0,
            heart_rate_bpm: 0,
            level: 0,
            calories_kcal: 0.0,
            power_watts: 0,
            speed_kmh: 0.0,
            timestamp: SystemTime::now(),
        }
    }
}

/// Wrap-around correction for the bike's 0..999 distance counter
///
/// The bike reports distance as a rolling count that resets to a low value
/// after 999. The tracker folds those wraps into a monotonic total: a raw
/// value numerically below the previous poll's value means the counter
/// wrapped. The very first observation seeds the baseline without counting
/// as a wrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistanceTracker {
    prev_raw: Option<u16>,
    wrap_count: u32,
}

impl DistanceTracker {
    /// Create a tracker with no baseline (fresh session)
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev_raw: None,
            wrap_count: 0,
        }
    }

    /// Fold one raw counter observation into the running total
    ///
    /// Returns the wrap-corrected full count
    /// (`wrap_count * 1000 + raw`).
    pub fn observe(&mut self, raw: u16) -> u32 {
        if let Some(prev) = self.prev_raw {
            if raw < prev {
                self.wrap_count += 1;
            }
        }
        self.prev_raw = Some(raw);
        self.wrap_count * DISTANCE_COUNTER_MODULUS + u32::from(raw)
    }

    /// Reset after a clear-data command
    ///
    /// Both the wrap count and the stored previous raw value go to zero,
    /// independent of what the device reports afterwards.
    pub const fn reset(&mut self) {
        self.prev_raw = Some(0);
        self.wrap_count = 0;
    }

    /// Number of wraps folded in so far
    #[must_use]
    pub const fn wrap_count(&self) -> u32 {
        self.wrap_count
    }
}

/// Convert a wrap-corrected count into kilometres
///
/// `km = (wheel_diameter_in * counts * π * 2.54) / 100000` — the vendor
/// app's own conversion, one count per flywheel revolution.
#[must_use]
pub fn counts_to_km(full_counts: u32, wheel_diameter_in: f64) -> f64 {
    wheel_diameter_in * f64::from(full_counts) * std::f64::consts::PI * 2.54 / 100_000.0
}

/// Derive speed in km/h from cadence
#[must_use]
pub fn speed_from_rpm(rpm: u16) -> f64 {
    f64::from(rpm) * SPEED_KMH_PER_RPM
}

/// Convert the raw calorie field (centi-kcal) into kcal
#[must_use]
pub fn calories_from_raw(raw: u32) -> f64 {
    f64::from(raw) / 100.0
}

/// Timeouts bounding every blocking operation against the bike
///
/// Cancellation is timeout-based only: a stuck receive is abandoned by
/// timing out and counting a liveness miss, never by interrupting the
/// socket read from another thread.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-step receive timeout during the handshake in milliseconds
    pub handshake_timeout_ms: u64,
    /// Receive timeout for one sport-data poll in milliseconds; longer than
    /// the 200 ms poll cadence to tolerate jitter
    pub poll_timeout_ms: u64,
    /// Receive timeout for control-command acknowledgments in milliseconds
    pub ack_timeout_ms: u64,
    /// Cadence the background worker polls at, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2_000,
            handshake_timeout_ms: 2_000,
            poll_timeout_ms: 1_000,
            ack_timeout_ms: 500,
            poll_interval_ms: 200,
        }
    }
}

/// Client configuration: timeouts plus the sport-frame layout variant
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Operation timeouts
    pub timeouts: TimeoutConfig,
    /// Fixed-offset layout of the sport-data record
    pub frame_layout: SportFrameLayout,
}
