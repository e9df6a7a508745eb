//! Workout program files and segment scheduling
//!
//! A program is a plain-text segment script:
//!
//! ```text
//! # Hill climb: easy start, hard middle
//! SEGMENTS:4
//! SEG:1:3
//! SEG:3:5
//! ```
//!
//! `SEGMENTS:<n>` declares how many equal-length segments the program has;
//! each `SEG:<segment>:<level>` line sets the resistance level from that
//! segment onward, so sparse files describe step profiles compactly (above:
//! segments 1–2 ride at level 3, segments 3–4 at level 5). The file carries
//! no timing — the rider picks a total duration and the program divides it
//! evenly across segments.
//!
//! Programs are pure schedules: every query takes the elapsed time as an
//! argument, so driving [`set_level`](crate::BikeClient::set_level) on a
//! cadence stays in the caller's loop and the same program value can be
//! reused across rides.

use std::{fs, io, path::Path, time::Duration};
use thiserror::Error;

/// Errors from parsing or loading program files
#[derive(Debug, Error)]
pub enum ProgramError {
    /// No `SEGMENTS:<n>` header line was found
    #[error("program has no SEGMENTS header")]
    MissingHeader,

    /// The header declared zero segments
    #[error("program declares zero segments")]
    NoSegments,

    /// No `SEG:<segment>:<level>` lines were found
    #[error("program defines no segment levels")]
    NoLevels,

    /// A `SEGMENTS:` or `SEG:` line did not parse
    #[error("unparseable program line {line}: {text:?}")]
    BadLine {
        /// 1-based line number in the file
        line: usize,
        /// The offending line, verbatim
        text: String,
    },

    /// A `SEG:` line referenced a segment outside the declared count
    #[error("segment {segment} outside 1..={total}")]
    SegmentOutOfRange {
        /// The referenced segment number
        segment: u32,
        /// The declared segment count
        total: u32,
    },

    /// Reading a program file or directory failed
    #[error("failed to read program file")]
    Io(#[from] io::Error),
}

/// Progress through a running program at some elapsed time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramProgress {
    /// Completion percentage, 0.0 to 100.0
    pub percent: f64,
    /// Time left until the program ends
    pub remaining: Duration,
    /// 1-based current segment; the last segment once complete
    pub segment: u32,
}

/// A parsed workout program: a step profile of resistance levels
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use wheelers::SportProgram;
///
/// let text = "SEGMENTS:4\nSEG:1:3\nSEG:3:5\n";
/// let program = SportProgram::parse("Hill Climb", text)?.with_duration(4);
///
/// assert_eq!(program.level_at(Duration::from_secs(0)), Some(3));
/// assert_eq!(program.level_at(Duration::from_secs(130)), Some(5));
/// assert_eq!(program.level_at(Duration::from_secs(241)), None);
/// # Ok::<(), wheelers::program::ProgramError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SportProgram {
    name: String,
    total_segments: u32,
    /// Sorted `(segment, level)` breakpoints; each holds until the next
    levels: Vec<(u32, u8)>,
    duration: Duration,
}

impl SportProgram {
    /// Parse a program from its text form
    ///
    /// Blank lines, `#` comments and unrecognized lines are ignored, as the
    /// files often carry free-form descriptions. The parsed program has no
    /// duration until [`with_duration`](Self::with_duration) sets one.
    ///
    /// # Errors
    ///
    /// Returns a [`ProgramError`] when the header is missing or zero, a
    /// recognized line fails to parse, a segment falls outside the declared
    /// count, or no levels are defined at all.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, ProgramError> {
        let mut total = None;
        let mut levels: Vec<(u32, u8)> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let bad = || ProgramError::BadLine {
                line: idx + 1,
                text: raw.to_string(),
            };

            if let Some(count) = line.strip_prefix("SEGMENTS:") {
                let count: u32 = count.trim().parse().map_err(|_| bad())?;
                if count == 0 {
                    return Err(ProgramError::NoSegments);
                }
                total = Some(count);
            } else if let Some(rest) = line.strip_prefix("SEG:") {
                let (segment, level) = rest.split_once(':').ok_or_else(|| bad())?;
                let segment: u32 = segment.trim().parse().map_err(|_| bad())?;
                let level: u8 = level.trim().parse().map_err(|_| bad())?;
                levels.push((segment, level));
            }
        }

        let total = total.ok_or(ProgramError::MissingHeader)?;
        if levels.is_empty() {
            return Err(ProgramError::NoLevels);
        }
        for &(segment, _) in &levels {
            if segment < 1 || segment > total {
                return Err(ProgramError::SegmentOutOfRange { segment, total });
            }
        }
        levels.sort_unstable_by_key(|&(segment, _)| segment);

        Ok(Self {
            name: name.into(),
            total_segments: total,
            levels,
            duration: Duration::ZERO,
        })
    }

    /// Load every `*.txt` program in a directory, sorted by name
    ///
    /// Display names come from the file stems, underscores spaced and words
    /// capitalized (`hill_climb.txt` becomes `Hill Climb`). The loaded
    /// programs have no duration yet.
    ///
    /// # Errors
    ///
    /// Returns [`ProgramError::Io`] on filesystem failures, or the parse
    /// error of the first malformed program file.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>, ProgramError> {
        let mut programs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            programs.push(Self::parse(display_name(&path), &text)?);
        }
        programs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(programs)
    }

    /// Spread the program across a total ride duration, in minutes
    #[must_use]
    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.duration = Duration::from_secs(u64::from(minutes) * 60);
        self
    }

    /// Display name of the program
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared number of segments
    #[must_use]
    pub const fn total_segments(&self) -> u32 {
        self.total_segments
    }

    /// Length of each segment under the configured duration
    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        self.duration / self.total_segments
    }

    /// 1-based segment active at `elapsed`, `None` once the program is over
    #[must_use]
    pub fn segment_at(&self, elapsed: Duration) -> Option<u32> {
        let per_segment = self.segment_duration();
        if per_segment.is_zero() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let segment = (elapsed.as_secs_f64() / per_segment.as_secs_f64()) as u32 + 1;
        (segment <= self.total_segments).then_some(segment)
    }

    /// Resistance level the program asks for at `elapsed`
    ///
    /// `None` when the program is over, has no duration set, or defines no
    /// level yet (a sparse file whose first breakpoint is still ahead).
    #[must_use]
    pub fn level_at(&self, elapsed: Duration) -> Option<u8> {
        let segment = self.segment_at(elapsed)?;
        self.levels
            .iter()
            .take_while(|&&(breakpoint, _)| breakpoint <= segment)
            .last()
            .map(|&(_, level)| level)
    }

    /// Whether the configured duration has fully elapsed
    #[must_use]
    pub fn is_complete(&self, elapsed: Duration) -> bool {
        !self.duration.is_zero() && elapsed >= self.duration
    }

    /// Progress through the program at `elapsed`
    ///
    /// With no duration configured, reports zero progress in segment 0.
    #[must_use]
    pub fn progress(&self, elapsed: Duration) -> ProgramProgress {
        if self.duration.is_zero() {
            return ProgramProgress {
                percent: 0.0,
                remaining: Duration::ZERO,
                segment: 0,
            };
        }
        if elapsed >= self.duration {
            return ProgramProgress {
                percent: 100.0,
                remaining: Duration::ZERO,
                segment: self.total_segments,
            };
        }
        ProgramProgress {
            percent: elapsed.as_secs_f64() / self.duration.as_secs_f64() * 100.0,
            remaining: self.duration - elapsed,
            segment: self.segment_at(elapsed).unwrap_or(0),
        }
    }
}

/// `hill_climb.txt` -> `Hill Climb`
fn display_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("program");
    stem.split('_')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().collect::<String>() + chars.as_str()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}
