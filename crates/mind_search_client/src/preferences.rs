//! Small persisted key-value store for UI preferences, and the theme toggle built on it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Key under which the theme choice is stored.
pub const DARK_MODE_KEY: &str = "darkMode";

/// Preferences load/save error.
#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// YAML-backed key-value store. Every write is persisted immediately.
#[derive(Debug, Clone)]
pub struct Preferences {
    path: PathBuf,
    values: BTreeMap<String, serde_yaml::Value>,
}

impl Preferences {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PreferencesError> {
        let path = path.into();
        let contents = if path.exists() {
            std::fs::read_to_string(&path)?
        } else {
            String::new()
        };
        let values = if contents.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(&contents)?
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(serde_yaml::Value::as_bool)
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<(), PreferencesError> {
        self.values.insert(key.to_string(), serde_yaml::Value::Bool(value));
        self.persist()
    }

    fn persist(&self) -> Result<(), PreferencesError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_yaml::to_string(&self.values)?)?;
        Ok(())
    }
}

/// Light/dark theme choice. Read from the store once, written on every toggle.
#[derive(Debug)]
pub struct ThemePreference {
    dark_mode: bool,
    store: Preferences,
}

impl ThemePreference {
    /// Dark mode is the default when nothing has been stored yet.
    pub fn load(store: Preferences) -> Self {
        let dark_mode = store.get_bool(DARK_MODE_KEY).unwrap_or(true);
        debug!(dark_mode, path = %store.path().display(), "loaded theme preference");
        Self { dark_mode, store }
    }

    pub fn is_dark(&self) -> bool {
        self.dark_mode
    }

    /// Flip the theme and persist it. Returns the new dark-mode value.
    pub fn toggle(&mut self) -> Result<bool, PreferencesError> {
        self.dark_mode = !self.dark_mode;
        self.store.set_bool(DARK_MODE_KEY, self.dark_mode)?;
        Ok(self.dark_mode)
    }
}
