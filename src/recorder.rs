//! CSV session logging
//!
//! One [`SessionRecorder`] is one ride: it opens a timestamped CSV file up
//! front and appends a row per recorded snapshot, flushing each row so a
//! crash mid-ride loses nothing. Sampling cadence is the caller's choice;
//! once a second reads well in most plotting tools.

use crate::types::SportSnapshot;
use chrono::Local;
use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::info;

const HEADER: &str =
    "timestamp,elapsed_seconds,distance_km,speed_kmh,rpm,heart_rate_bpm,level,calories_kcal,watts";

/// Appends ride telemetry to a `workout_<date>_<tag>.csv` file
///
/// # Examples
///
/// ```no_run
/// use wheelers::{SessionRecorder, SportSnapshot};
///
/// let mut recorder = SessionRecorder::create("activity_logs", "manual")?;
/// recorder.record(&SportSnapshot::default())?;
/// println!("Logging to {}", recorder.path().display());
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct SessionRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    started: Instant,
}

impl SessionRecorder {
    /// Open `dir/workout_<YYYYmmdd_HHMMSS>_<tag>.csv` and write the header
    ///
    /// The directory is created if missing. The tag names the ride in the
    /// filename (a program name, or `manual`) and must be filename-safe.
    /// Elapsed time counts from this call.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the directory or file cannot
    /// be created.
    pub fn create(dir: impl AsRef<Path>, tag: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.as_ref().join(format!("workout_{stamp}_{tag}.csv"));

        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{HEADER}")?;
        writer.flush()?;

        info!("Recording session to {}", path.display());
        Ok(Self {
            writer,
            path,
            started: Instant::now(),
        })
    }

    /// Append one telemetry row and flush it to disk
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on a failed write.
    pub fn record(&mut self, snapshot: &SportSnapshot) -> io::Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let elapsed = self.started.elapsed().as_secs_f64();
        writeln!(
            self.writer,
            "{timestamp},{elapsed:.2},{:.3},{:.1},{},{},{},{:.1},{}",
            snapshot.distance_km,
            snapshot.speed_kmh,
            snapshot.rpm,
            snapshot.heart_rate_bpm,
            snapshot.level,
            snapshot.calories_kcal,
            snapshot.power_watts,
        )?;
        self.writer.flush()
    }

    /// Path of the CSV file being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
