#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Wheelers 🚴
//!
//! A Rust library for controlling iSuper stationary exercise bikes over
//! WiFi/TCP.
//!
//! The bike speaks a proprietary ASCII line-protocol on TCP port 1971. The
//! protocol implemented here was reverse-engineered from the vendor's own
//! companion app and from packet captures of a live unit, including:
//!
//! - **Framing**: `<TAG_PAYLOAD>` ASCII messages, optionally CRLF-padded
//! - **Handshake**: the fixed, ordered initialization sequence that carries
//!   the device credential, resistance range, wheel diameter and MAC address
//! - **Sport data**: the fixed-offset telemetry record polled in sport mode,
//!   including the 0..999 distance counter and its wrap-around correction
//! - **Commands**: resume/pause, resistance level, clear-data and terminate
//! - **Calibration**: the speed and calorie conversion constants the vendor
//!   app uses, reproduced exactly for output compatibility
//!
//! ## Connection modes
//!
//! In P2P mode the bike hosts its own WiFi access point and is reachable at a
//! fixed address ([`DEFAULT_P2P_HOST`]). In AP mode the bike joins an existing
//! network and gets its address from that network's DHCP; pass whatever
//! address your router assigned.
//!
//! ## Quick Start
//!
//! ```no_run
//! use wheelers::BikeClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut bike = BikeClient::new();
//!
//!     // Connect and run the initialization handshake
//!     bike.connect(wheelers::DEFAULT_P2P_HOST).await?;
//!     let info = bike.initialize().await?;
//!     println!("Resistance range: {}-{}", info.resistance_min, info.resistance_max);
//!
//!     // Enter sport mode and poll telemetry
//!     bike.start_sport().await?;
//!     if let Some(snapshot) = bike.poll().await? {
//!         println!("{:.2} km at {:.1} km/h", snapshot.distance_km, snapshot.speed_kmh);
//!     }
//!
//!     bike.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! The blocking request/response cycle can also be pushed onto a dedicated
//! task with [`BikeWorker`], which polls on a fixed cadence and hands
//! snapshots back over a watch channel. See the `demos/` directory.

/// Main session interface and state machine
pub mod device;
/// Error types and handling
pub mod error;
/// TCP connection and frame transport
pub mod net;
/// Workout program files and segment scheduling
pub mod program;
/// Wire protocol framing, commands and sport-record parsing
pub mod protocol;
/// CSV session logging
pub mod recorder;
/// Type definitions and data structures
pub mod types;
/// Background worker owning a session, with a channel-based handle
pub mod worker;

// Re-export the main types for convenient usage
pub use device::{BikeClient, MAX_MISSED_RESPONSES};
pub use error::{
    BikeError, CommandError, ConnectError, HandshakeError, HandshakeStep, PollError, Result,
};
pub use program::SportProgram;
pub use recorder::SessionRecorder;
pub use types::{
    ClientConfig, DeviceInfo, SessionPhase, SportFrameLayout, SportSnapshot, TimeoutConfig,
};
pub use worker::{BikeHandle, BikeWorker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// TCP port the bike listens on, identical in P2P and AP mode
pub const PORT: u16 = 1971;

/// Fixed address the bike assigns itself when hosting its own access point
///
/// In P2P mode the bike runs a DHCP-less link-local network; the controller
/// joins the bike's WiFi and reaches it at this address. In AP mode the
/// address is assigned by the joined network instead.
pub const DEFAULT_P2P_HOST: &str = "169.254.1.1";

/// Credential string the bike announces during the initialization handshake
///
/// Extracted from the vendor app. The bike sends it in the `EP` frame and the
/// client verifies it; some firmware revisions omit or alter the field, so a
/// mismatch is logged but never fatal.
pub const AUTH_PASSWORD: &str = "SUPERWIGH";

/// Fallback wheel diameter in inches used before initialization completes
///
/// Every observed unit reports its real diameter in the `ED` handshake frame;
/// this value only backs [`types::DeviceInfo::default`].
pub const DEFAULT_WHEEL_DIAMETER_IN: f64 = 21.0;
