use crate::types::SportFrameLayout;
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Frame tag: start-init request and init acknowledgment
pub const TAG_INIT: &str = "EQ";
/// Frame tag: credential announcement
pub const TAG_PASSWORD: &str = "EP";
/// Frame tag: resistance range (`MIN-MAX`)
pub const TAG_RESISTANCE_RANGE: &str = "ER";
/// Frame tag: wheel diameter in inches ×100
pub const TAG_WHEEL_DIAMETER: &str = "ED";
/// Frame tag: device MAC address as hex text
pub const TAG_MAC_ADDRESS: &str = "EA";
/// Frame tag: stored memory/odometer data
pub const TAG_MEMORY: &str = "EM";
/// Frame tag: equipment type (informational, optional)
pub const TAG_EQUIPMENT: &str = "ET";
/// Frame tag: vendor info (informational, optional)
pub const TAG_VENDOR: &str = "EV";
/// Frame tag: end-of-init marker
pub const TAG_END_OF_INIT: &str = "Ez";
/// Frame tag: sport-data request (payload `6`)
pub const TAG_DATA_REQUEST: &str = "WB";
/// Frame tag: sport-data record and its acknowledgment
pub const TAG_SPORT_DATA: &str = "W6";
/// Frame tag: control — resume (`000`) and pause (`300`)
pub const TAG_CONTROL: &str = "CP";
/// Frame tag: clear accumulated data
pub const TAG_CLEAR: &str = "CC";
/// Frame tag: set resistance level (two zero-padded digits, zero-indexed)
pub const TAG_SET_LEVEL: &str = "CR";
/// Frame tag: terminate session
pub const TAG_TERMINATE: &str = "AT";

/// Payload acknowledging a received informational frame
pub const PAYLOAD_OK: &str = "OK";
/// `CP` payload that resumes sport mode
pub const PAYLOAD_RESUME: &str = "000";
/// `CP` payload that pauses sport mode
pub const PAYLOAD_PAUSE: &str = "300";
/// `WB` payload selecting the sport-data record
pub const PAYLOAD_DATA_REQUEST: &str = "6";

/// One protocol message: `<TAG_PAYLOAD>` on the wire
///
/// The payload is optional; the bike sends tag-only frames like `<EQ>`.
/// Outgoing commands always carry the underscore, even with an empty
/// payload (`<CC_>`), matching the vendor app byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Two-character frame tag
    pub tag: String,
    /// Everything after the first underscore, unsplit
    pub payload: Option<String>,
}

impl Frame {
    /// Create a frame with a payload
    pub fn new(tag: &str, payload: &str) -> Self {
        Self {
            tag: tag.to_string(),
            payload: Some(payload.to_string()),
        }
    }

    /// Acknowledgment frame for an informational tag (`<EP_OK>` etc.)
    pub fn ok(tag: &str) -> Self {
        Self::new(tag, PAYLOAD_OK)
    }

    /// `<EQ_>` — start the initialization handshake
    pub fn start_init() -> Self {
        Self::new(TAG_INIT, "")
    }

    /// `<WB_6>` — request one sport-data record
    pub fn data_request() -> Self {
        Self::new(TAG_DATA_REQUEST, PAYLOAD_DATA_REQUEST)
    }

    /// `<W6_OK>` — acknowledge a decoded sport-data record
    pub fn sport_ack() -> Self {
        Self::ok(TAG_SPORT_DATA)
    }

    /// `<CP_000>` — resume sport mode
    pub fn resume() -> Self {
        Self::new(TAG_CONTROL, PAYLOAD_RESUME)
    }

    /// `<CP_300>` — pause sport mode
    pub fn pause() -> Self {
        Self::new(TAG_CONTROL, PAYLOAD_PAUSE)
    }

    /// `<CC_>` — clear accumulated distance/calorie data
    pub fn clear() -> Self {
        Self::new(TAG_CLEAR, "")
    }

    /// `<CR_nn>` — set the wire-level resistance (already zero-indexed)
    pub fn set_level(wire_level: u8) -> Self {
        Self::new(TAG_SET_LEVEL, &format!("{wire_level:02}"))
    }

    /// `<AT_>` — terminate the session
    pub fn terminate() -> Self {
        Self::new(TAG_TERMINATE, "")
    }

    /// Serialize for the wire
    #[must_use]
    pub fn encode(&self) -> String {
        match &self.payload {
            Some(payload) => format!("<{}_{payload}>", self.tag),
            None => format!("<{}>", self.tag),
        }
    }

    /// Parse the text between `<` and `>`
    ///
    /// Stray CR/LF bytes inside the frame body are stripped; they show up
    /// when the bike pads a frame across a TCP segment boundary.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let clean: String = body.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        match clean.split_once('_') {
            Some((tag, payload)) => Self {
                tag: tag.to_string(),
                payload: Some(payload.to_string()),
            },
            None => Self {
                tag: clean,
                payload: None,
            },
        }
    }

    /// Payload string, or `""` for a tag-only frame
    #[must_use]
    pub fn payload_str(&self) -> &str {
        self.payload.as_deref().unwrap_or("")
    }

    /// True for acknowledgment frames (`OK` payload)
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.payload.as_deref() == Some(PAYLOAD_OK)
    }
}

/// Split all complete frames out of a receive buffer
///
/// Bytes before the first `<` are line noise and are dropped. A trailing
/// partial frame stays in the buffer for the next read; frames split across
/// TCP segments reassemble across calls.
pub fn extract_frames(buf: &mut BytesMut) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        let Some(open) = buf.iter().position(|&b| b == b'<') else {
            buf.clear();
            break;
        };
        if open > 0 {
            buf.advance(open);
        }
        let Some(close) = buf.iter().position(|&b| b == b'>') else {
            break;
        };
        let body = String::from_utf8_lossy(&buf[1..close]).into_owned();
        frames.push(Frame::parse(&body));
        buf.advance(close + 1);
    }
    frames
}

/// A decoded sport-data record before wrap correction and unit conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SportRecord {
    /// Rolling single-digit sync counter
    pub sync: u8,
    /// Raw distance counter, 0..999
    pub distance: u16,
    /// Cadence in RPM
    pub rpm: u16,
    /// Heart rate in BPM
    pub heart_rate: u16,
    /// Resistance level (display numbering)
    pub level: u8,
    /// Raw calorie field (centi-kcal); zero on layouts without the field
    pub calories_raw: u32,
    /// Output power in watts
    pub power: u16,
}

/// Why a sport-data payload was rejected
///
/// Rejection is absorbed by the session as "no update"; the variants exist
/// so the discard can be logged precisely and tested.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Payload is not the exact fixed width of the configured layout
    #[error("sport record has {actual} chars, layout requires {expected}")]
    WrongLength {
        /// Width the layout requires
        expected: usize,
        /// Width actually received
        actual: usize,
    },

    /// A fixed-offset field did not parse as an unsigned integer
    #[error("sport record field {field:?} is not numeric: {text:?}")]
    BadField {
        /// Field name
        field: &'static str,
        /// Offending slice
        text: String,
    },
}

/// Exact payload width the layout requires
#[must_use]
pub const fn record_width(layout: SportFrameLayout) -> usize {
    match layout {
        // S,DDD,RRR,PPP,LL,CCCCCC,WWW,XX
        SportFrameLayout::DistanceFirst => 30,
        // S,WWW,PPP,LL,DDD,RRR
        SportFrameLayout::PowerFirst => 20,
    }
}

fn field<T: std::str::FromStr>(
    payload: &str,
    name: &'static str,
    start: usize,
    end: usize,
) -> Result<T, RecordError> {
    let text = &payload[start..end];
    text.parse().map_err(|_| RecordError::BadField {
        field: name,
        text: text.to_string(),
    })
}

/// Decode a `W6` payload by fixed offsets
///
/// Fields are positional, not delimiter-split: a numeric field may itself
/// contain a byte that doubles as the protocol's separator elsewhere, so
/// splitting on commas silently misparses. Offsets per
/// [`SportFrameLayout`]; any width or digit failure rejects the whole
/// record.
pub fn parse_sport_record(
    payload: &str,
    layout: SportFrameLayout,
) -> Result<SportRecord, RecordError> {
    let expected = record_width(layout);
    if payload.len() != expected || !payload.is_ascii() {
        return Err(RecordError::WrongLength {
            expected,
            actual: payload.len(),
        });
    }

    match layout {
        SportFrameLayout::DistanceFirst => Ok(SportRecord {
            sync: field(payload, "sync", 0, 1)?,
            distance: field(payload, "distance", 2, 5)?,
            rpm: field(payload, "rpm", 6, 9)?,
            heart_rate: field(payload, "pulse", 10, 13)?,
            level: field(payload, "level", 14, 16)?,
            calories_raw: field(payload, "calories", 17, 23)?,
            power: field(payload, "power", 24, 27)?,
            // trailing reserved field [28..30] is ignored
        }),
        SportFrameLayout::PowerFirst => Ok(SportRecord {
            sync: field(payload, "sync", 0, 1)?,
            power: field(payload, "power", 2, 5)?,
            heart_rate: field(payload, "pulse", 6, 9)?,
            level: field(payload, "level", 10, 12)?,
            distance: field(payload, "distance", 13, 16)?,
            rpm: field(payload, "rpm", 17, 20)?,
            calories_raw: 0,
        }),
    }
}

/// Clamp a requested display level and convert to the zero-indexed wire level
///
/// The wire is zero-indexed: `CR_00` selects display level 1. Requests above
/// the device range clamp to the maximum, requests of zero clamp to the
/// minimum; a negative request cannot be represented at all and is rejected
/// with the device's range. A degenerate range (empty, or with no display
/// level at 1 or above) admits no representable level, so every request
/// against it is rejected the same way.
pub fn encode_level(requested: i32, min: u8, max: u8) -> Result<u8, crate::error::CommandError> {
    let floor = min.max(1);
    if requested < 0 || floor > max {
        return Err(crate::error::CommandError::LevelOutOfRange {
            requested,
            min,
            max,
        });
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let display = (requested as u32).clamp(u32::from(floor), u32::from(max)) as u8;
    Ok(display - 1)
}
