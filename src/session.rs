//! Session directories and JSON snapshots.
//!
//! A session is one timestamped directory per workflow run, holding the
//! log file, saved [`MicroscopeState`] snapshots and a metadata record of
//! the settings in force.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::MicroscopeSettings;
use crate::error::AppResult;
use crate::state::MicroscopeState;

/// Timestamp format used in session directory names.
pub const SESSION_TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H-%M-%S";

/// Name of the metadata file.
pub const METADATA_FILE_NAME: &str = "metadata.json";

#[derive(Serialize)]
struct Metadata<'a> {
    session: &'a str,
    created: DateTime<Local>,
    crate_version: &'static str,
    settings: &'a MicroscopeSettings,
}

/// A session directory.
#[derive(Debug, Clone)]
pub struct Session {
    name: String,
    path: PathBuf,
    created: DateTime<Local>,
}

impl Session {
    /// Creates `<base>/<name>_<timestamp>` and any missing parents.
    pub fn create<P: AsRef<Path>>(base: P, name: &str) -> AppResult<Self> {
        let created = Local::now();
        let dir_name = format!("{}_{}", name, created.format(SESSION_TIMESTAMP_FORMAT));
        let path = base.as_ref().join(&dir_name);
        fs::create_dir_all(&path)?;
        info!("Session directory {}", path.display());
        Ok(Self {
            name: dir_name,
            path,
            created,
        })
    }

    /// Directory name, including the timestamp.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `state` to `<label>.json`.
    pub fn save_state(&self, state: &MicroscopeState, label: &str) -> AppResult<PathBuf> {
        let path = self.path.join(format!("{}.json", label));
        fs::write(&path, serde_json::to_string_pretty(state)?)?;
        info!("Saved microscope state to {}", path.display());
        Ok(path)
    }

    /// Reads a state written by [`Session::save_state`].
    pub fn load_state<P: AsRef<Path>>(path: P) -> AppResult<MicroscopeState> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes the settings in force to `metadata.json`.
    pub fn save_metadata(&self, settings: &MicroscopeSettings) -> AppResult<PathBuf> {
        let metadata = Metadata {
            session: &self.name,
            created: self.created,
            crate_version: env!("CARGO_PKG_VERSION"),
            settings,
        };
        let path = self.path.join(METADATA_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_directory_name() {
        let base = tempfile::tempdir().unwrap();
        let session = Session::create(base.path(), "lamella").unwrap();
        assert!(session.path().is_dir());
        assert!(session.name().starts_with("lamella_"));
        assert_eq!(session.path().parent().unwrap(), base.path());
    }

    #[test]
    fn test_metadata_contains_settings() {
        let base = tempfile::tempdir().unwrap();
        let session = Session::create(base.path(), "meta").unwrap();
        let path = session.save_metadata(&MicroscopeSettings::default()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["settings"]["system"]["manufacturer"], "thermo");
        assert_eq!(value["settings"]["calibration"]["tilt_flat_to_ion"], 52.0);
        assert_eq!(value["session"], session.name());
    }
}
