//! Operator preferences storage
//!
//! Handles saving and loading operator preferences to a JSON file
//! in the platform config directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Operator preferences
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Preferences {
    /// Only list sessions of this department (None = all departments)
    pub department_filter: Option<String>,
}

/// Get the preferences file path
fn preferences_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Facemark").join("preferences.json"))
}

/// Load preferences from disk
///
/// Returns default preferences if the file doesn't exist or can't be read
pub(crate) fn load_preferences() -> Preferences {
    match preferences_path() {
        Some(path) => load_from(&path),
        None => Preferences::default(),
    }
}

fn load_from(path: &Path) -> Preferences {
    if !path.exists() {
        return Preferences::default();
    }

    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(prefs) => prefs,
            Err(e) => {
                error!("Failed to parse preferences: {}", e);
                Preferences::default()
            }
        },
        Err(e) => {
            error!("Failed to read preferences file: {}", e);
            Preferences::default()
        }
    }
}

/// Save preferences to disk
pub(crate) fn save_preferences(prefs: &Preferences) -> Result<(), PreferencesError> {
    let path = preferences_path().ok_or(PreferencesError::NoConfigDir)?;
    save_to(&path, prefs)
}

fn save_to(path: &Path, prefs: &Preferences) -> Result<(), PreferencesError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            info!("Created preferences directory: {:?}", parent);
        }
    }

    let json = serde_json::to_string_pretty(prefs)?;
    fs::write(path, json)?;
    info!("Saved preferences to: {:?}", path);

    Ok(())
}

/// Get the saved department filter, if any
pub(crate) fn get_department_filter() -> Option<String> {
    load_preferences()
        .department_filter
        .filter(|d| !d.trim().is_empty())
}

/// Set the department filter (None = all departments)
pub(crate) fn set_department_filter(department: Option<&str>) -> Result<(), PreferencesError> {
    let mut prefs = load_preferences();
    prefs.department_filter = department.map(str::to_string);
    save_preferences(&prefs)
}

/// Preferences errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum PreferencesError {
    #[error("Could not find config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
