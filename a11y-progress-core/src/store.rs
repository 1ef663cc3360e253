//! Client state holder
//!
//! An explicit replacement for a process-wide mutable store. Only
//! [`Preferences`] survive a restart; everything else is transient and
//! starts empty on every load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::progress::ProgressSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

impl std::str::FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Theme::System),
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(format!("unknown theme: {}", other)),
        }
    }
}

/// Findings filters remembered between sessions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FindingFilters {
    pub severities: Vec<String>,
    pub agents: Vec<String>,
    pub search: Option<String>,
}

/// The persisted subset of client state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub theme: Theme,
    pub filters: FindingFilters,
}

impl Preferences {
    /// Load from `path`, falling back to defaults when missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read preferences");
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(prefs) => prefs,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt preferences");
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Client state passed by reference to whoever needs it
pub struct ClientStore {
    path: PathBuf,
    preferences: Preferences,
    current_upload_id: Option<String>,
    last_snapshot: Option<ProgressSnapshot>,
}

impl ClientStore {
    /// Load from the default XDG location
    pub fn load() -> Self {
        Self::load_from(Config::preferences_path())
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let preferences = Preferences::load_from(&path);
        Self {
            path,
            preferences,
            current_upload_id: None,
            last_snapshot: None,
        }
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn set_theme(&mut self, theme: Theme) -> Result<()> {
        self.update_preferences(|prefs| prefs.theme = theme)
    }

    pub fn set_filters(&mut self, filters: FindingFilters) -> Result<()> {
        self.update_preferences(|prefs| prefs.filters = filters)
    }

    /// Apply a change and persist it if anything actually changed
    pub fn update_preferences(&mut self, change: impl FnOnce(&mut Preferences)) -> Result<()> {
        let mut next = self.preferences.clone();
        change(&mut next);
        if next == self.preferences {
            return Ok(());
        }
        next.save_to(&self.path)?;
        self.preferences = next;
        tracing::debug!(path = %self.path.display(), "Preferences saved");
        Ok(())
    }

    pub fn current_upload_id(&self) -> Option<&str> {
        self.current_upload_id.as_deref()
    }

    pub fn set_current_upload_id(&mut self, upload_id: Option<String>) {
        if self.current_upload_id != upload_id {
            self.last_snapshot = None;
        }
        self.current_upload_id = upload_id;
    }

    pub fn last_snapshot(&self) -> Option<&ProgressSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn record_snapshot(&mut self, snapshot: ProgressSnapshot) {
        self.last_snapshot = Some(snapshot);
    }
}
