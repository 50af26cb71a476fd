//! Watchdog Sentinel and Violent Reboot
//!
//! The sentinel is created at the top of the demote path and removed at its
//! bottom. Present after an unplanned boot = the previous life was killed
//! while exporting pools. Absent = any reboot was not engine-initiated.
//!
//! Write protocol:
//! 1. Write a single decimal timestamp
//! 2. fsync the file
//! 3. fsync the parent directory

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default sysrq enable switch
pub const SYSRQ_ENABLE_PATH: &str = "/proc/sys/kernel/sysrq";

/// Default sysrq trigger
pub const SYSRQ_TRIGGER_PATH: &str = "/proc/sysrq-trigger";

/// Presence-only marker shared with the alerting layer.
#[derive(Debug, Clone)]
pub struct WatchdogSentinel {
    path: PathBuf,
}

impl WatchdogSentinel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the sentinel with the current unix time and make it durable.
    pub fn arm(&self) -> io::Result<i64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let timestamp = chrono::Utc::now().timestamp();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(timestamp.to_string().as_bytes())?;
        file.sync_all()?;

        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        Ok(timestamp)
    }

    /// Remove the sentinel. Removing an absent sentinel is not an error.
    pub fn disarm(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                if let Some(parent) = self.path.parent() {
                    if let Ok(dir) = File::open(parent) {
                        let _ = dir.sync_all();
                    }
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.path.exists()
    }

    /// Timestamp written when the sentinel was armed, if readable.
    pub fn armed_at(&self) -> io::Result<Option<i64>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.trim().parse().ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Takes the machine down without a userspace unwind.
pub trait Rebooter: Send + Sync {
    fn reboot(&self) -> io::Result<()>;
}

/// Reboots through the kernel's magic sysrq interface.
#[derive(Debug, Clone)]
pub struct SysrqRebooter {
    enable_path: PathBuf,
    trigger_path: PathBuf,
}

impl SysrqRebooter {
    pub fn new(enable_path: impl Into<PathBuf>, trigger_path: impl Into<PathBuf>) -> Self {
        Self {
            enable_path: enable_path.into(),
            trigger_path: trigger_path.into(),
        }
    }
}

impl Default for SysrqRebooter {
    fn default() -> Self {
        Self::new(SYSRQ_ENABLE_PATH, SYSRQ_TRIGGER_PATH)
    }
}

impl Rebooter for SysrqRebooter {
    fn reboot(&self) -> io::Result<()> {
        tracing::error!("export deadline exceeded, rebooting through sysrq");
        fs::write(&self.enable_path, b"1")?;
        fs::write(&self.trigger_path, b"b")?;
        Ok(())
    }
}

/// How the previous life of this controller ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum BootCause {
    /// Killed by the export deadline while demoting
    WatchdogDuringDemotion { armed_at: Option<i64> },

    /// The engine did not initiate the reboot
    NotEngineInitiated,
}

impl BootCause {
    /// Alert text for the alerting layer
    pub fn alert_text(&self) -> &'static str {
        match self {
            BootCause::WatchdogDuringDemotion { .. } => "watchdog reboot",
            BootCause::NotEngineInitiated => "unauthorized reboot",
        }
    }
}

/// Classify the previous boot from the sentinel, then clear it.
pub fn classify_previous_boot(sentinel: &WatchdogSentinel) -> io::Result<BootCause> {
    if !sentinel.is_armed() {
        return Ok(BootCause::NotEngineInitiated);
    }

    let armed_at = sentinel.armed_at()?;
    sentinel.disarm()?;

    tracing::warn!(
        path = %sentinel.path().display(),
        armed_at,
        "previous boot ended with the watchdog sentinel present"
    );

    Ok(BootCause::WatchdogDuringDemotion { armed_at })
}
