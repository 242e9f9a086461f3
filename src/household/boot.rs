//! Power-cycle detection.
//!
//! The kernel exposes a random id that changes on every boot. Persisting the
//! id seen by the last run lets a new process tell a real power-on from a
//! mere restart of itself.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Linux per-boot random id.
pub const KERNEL_BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

#[derive(Debug, Error)]
pub enum BootMarkerError {
    #[error("current boot id is unavailable")]
    CurrentUnavailable,
    #[error("write boot marker {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub trait BootMarker {
    /// `true` unless a previous run in this same boot is positively known.
    fn is_fresh_boot(&self) -> bool;

    /// Persist the live boot id so the next start can compare against it.
    fn record_current_boot(&self) -> Result<(), BootMarkerError>;
}

/// Boot marker stored as a plain file, compared with a kernel id file.
#[derive(Debug, Clone)]
pub struct FileBootMarker {
    marker_path: PathBuf,
    boot_id_path: PathBuf,
}

impl FileBootMarker {
    pub fn new(marker_path: impl Into<PathBuf>, boot_id_path: impl Into<PathBuf>) -> Self {
        Self {
            marker_path: marker_path.into(),
            boot_id_path: boot_id_path.into(),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn current_boot_id(&self) -> Option<String> {
        match read_token(&self.boot_id_path) {
            Ok(token) => token,
            Err(err) => {
                warn!(path = %self.boot_id_path.display(), "cannot read boot id: {err}");
                None
            }
        }
    }

    fn recorded_boot_id(&self) -> io::Result<Option<String>> {
        read_token(&self.marker_path)
    }
}

impl BootMarker for FileBootMarker {
    fn is_fresh_boot(&self) -> bool {
        let Some(current) = self.current_boot_id() else {
            warn!("boot id unknown; assuming fresh boot");
            return true;
        };
        match self.recorded_boot_id() {
            Ok(Some(last)) if last == current => {
                info!(boot_id = %current, "same boot id; process restart");
                false
            }
            Ok(Some(last)) => {
                info!(previous = %last, current = %current, "boot id changed; fresh boot");
                true
            }
            Ok(None) => {
                info!("no previous boot id recorded; fresh boot");
                true
            }
            Err(err) => {
                warn!(
                    path = %self.marker_path.display(),
                    "cannot read boot marker, assuming fresh boot: {err}"
                );
                true
            }
        }
    }

    fn record_current_boot(&self) -> Result<(), BootMarkerError> {
        let current = self
            .current_boot_id()
            .ok_or(BootMarkerError::CurrentUnavailable)?;
        let write_err = |source| BootMarkerError::Write {
            path: self.marker_path.clone(),
            source,
        };
        if let Some(parent) = self.marker_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        fs::write(&self.marker_path, &current).map_err(write_err)?;
        debug!(boot_id = %current, path = %self.marker_path.display(), "boot marker saved");
        Ok(())
    }
}

/// Trimmed file contents; `Ok(None)` when the file is absent or blank.
fn read_token(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let token = raw.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
