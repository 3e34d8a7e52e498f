//! File-based cross-process control signals.
//!
//! A running orchestrator may be controlled by a separate CLI process, so the
//! control plane is a set of flag files polled once per watchdog tick. The
//! storage mechanism is wrapped behind `SignalChannel` so call sites do not
//! care that it is a file.

use crate::error::Result;
use crate::record;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One named cross-process signal backed by a flag file.
#[derive(Debug, Clone)]
pub struct SignalChannel {
    path: PathBuf,
}

impl SignalChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raise the signal (touch the flag file, refreshing its mtime).
    pub fn raise(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, b"")?;
        Ok(())
    }

    /// Raise the signal with a small text payload (e.g. a requested duration).
    pub fn raise_with(&self, payload: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, payload.as_bytes())?;
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Clear the signal. Missing flag is not an error.
    pub fn clear(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clear signal {}: {}", self.path.display(), e);
            }
        }
    }

    /// The payload written by `raise_with`, if the signal is set.
    pub fn payload(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    /// Last time the signal was raised, if set.
    pub fn raised_at(&self) -> Option<DateTime<Utc>> {
        let mtime = fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(DateTime::<Utc>::from(mtime))
    }

    /// Seconds since the signal was last raised, if set.
    pub fn age_secs(&self) -> Option<i64> {
        self.raised_at()
            .map(|t| (record::utc_now() - t).num_seconds())
    }
}

/// The full set of control signals for one device.
#[derive(Debug, Clone)]
pub struct SignalSet {
    /// User-requested stop; polled by the supervisory loop.
    pub stop: SignalChannel,
    /// Restart request raised by `sensor_failed`.
    pub restart: SignalChannel,
    /// Watchdog liveness marker, touched once per supervisory tick.
    pub running: SignalChannel,
    /// On-demand sensing trigger; payload is the requested duration in seconds.
    pub trigger: SignalChannel,
    /// Review-mode marker; auto-expires after `REVIEW_MODE_EXPIRY_SECS`.
    pub review_mode: SignalChannel,
}

/// Review mode clears itself after this long so a device cannot be left stuck
/// in a diagnostic mode.
pub const REVIEW_MODE_EXPIRY_SECS: i64 = 30 * 60;

impl SignalSet {
    pub fn new(flags_dir: &Path) -> Self {
        Self {
            stop: SignalChannel::new(flags_dir.join("stop_requested")),
            restart: SignalChannel::new(flags_dir.join("restart_requested")),
            running: SignalChannel::new(flags_dir.join("edgekit_is_running")),
            trigger: SignalChannel::new(flags_dir.join("sensing_trigger")),
            review_mode: SignalChannel::new(flags_dir.join("review_mode")),
        }
    }

    /// Whether review mode is active, clearing the flag if it has expired.
    pub fn review_mode_active(&self) -> bool {
        match self.review_mode.age_secs() {
            Some(age) if age > REVIEW_MODE_EXPIRY_SECS => {
                debug!("Review mode flag expired after {}s; clearing", age);
                self.review_mode.clear();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Read and parse the on-demand trigger duration, if the trigger is set.
    pub fn trigger_duration_secs(&self) -> Option<u64> {
        if !self.trigger.is_set() {
            return None;
        }
        match self.trigger.payload().map(|p| p.trim().parse::<u64>()) {
            Some(Ok(secs)) => Some(secs),
            _ => {
                warn!("Sensing trigger set with unreadable duration; assuming 0");
                Some(0)
            }
        }
    }
}
