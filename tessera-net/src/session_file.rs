//! Claimed-position persistence across device restarts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tessera_core::device::DeviceSession;

/// What a device needs to pick its position back up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedDevice {
    pub server_addr: String,
    pub device_name: String,
    pub session: DeviceSession,
}

/// Default location: `<config_dir>/tessera/device_session.json`.
pub fn session_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tessera").join("device_session.json"))
}

pub fn save_to(path: &Path, saved: &SavedDevice) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(saved)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(path, json)
}

/// A missing or unreadable file is `None`.
pub fn load_from(path: &Path) -> Option<SavedDevice> {
    let json = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&json) {
        Ok(saved) => Some(saved),
        Err(e) => {
            log::warn!("Ignoring malformed session file {}: {}", path.display(), e);
            None
        }
    }
}

pub fn clear_at(path: &Path) {
    let _ = fs::remove_file(path);
}

pub fn save_session(saved: &SavedDevice) -> io::Result<()> {
    let path = session_file_path()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot determine config dir"))?;
    save_to(&path, saved)
}

pub fn load_session() -> Option<SavedDevice> {
    load_from(&session_file_path()?)
}

pub fn clear_session() {
    if let Some(path) = session_file_path() {
        clear_at(&path);
    }
}
