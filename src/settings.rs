//! Persistent settings: global switch, trusted clients and capability flags.
//!
//! Persists to `{data_dir}/settings.json`. Reads are served from memory;
//! every mutation is written through to disk before it returns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::capability::{CapabilityBindings, EnabledAccessor};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Settings lock poisoned")]
    Poisoned,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Global switch for serving tools.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Client names approved with "always trust".
    #[serde(default)]
    pub trusted_clients: BTreeSet<String>,

    /// Per-capability enabled flags. Missing entries count as enabled.
    #[serde(default)]
    pub capabilities: BTreeMap<String, bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            trusted_clients: BTreeSet::new(),
            capabilities: BTreeMap::new(),
        }
    }
}

/// In-memory settings with disk persistence.
#[derive(Debug)]
pub struct SettingsStore {
    settings: RwLock<Settings>,
    storage_path: PathBuf,
    /// Serializes writers of the settings file.
    write_lock: tokio::sync::Mutex<()>,
}

impl SettingsStore {
    /// Create a new settings store, loading from disk if available.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub async fn new(data_dir: &Path) -> Self {
        let storage_path = data_dir.join("settings.json");

        let settings = if storage_path.exists() {
            match Self::load_from_path(&storage_path).await {
                Ok(s) => {
                    tracing::info!("Loaded settings from {}", storage_path.display());
                    s
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load settings from {}: {}, using defaults",
                        storage_path.display(),
                        e
                    );
                    Settings::default()
                }
            }
        } else {
            tracing::info!(
                "No settings file found at {}, using defaults",
                storage_path.display()
            );
            Settings::default()
        };

        Self {
            settings: RwLock::new(settings),
            storage_path,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn load_from_path(path: &Path) -> Result<Settings, SettingsError> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save current settings to disk.
    async fn save_to_disk(&self) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let contents = serde_json::to_string_pretty(&self.get()?)?;

        if let Some(parent) = self.storage_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.storage_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, &self.storage_path).await?;
        tracing::debug!("Saved settings to {}", self.storage_path.display());
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> Result<bool, SettingsError>
    where
        F: FnOnce(&mut Settings) -> bool,
    {
        let mut settings = self.settings.write().map_err(|_| SettingsError::Poisoned)?;
        Ok(mutate(&mut settings))
    }

    /// Get a clone of the current settings.
    pub fn get(&self) -> Result<Settings, SettingsError> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| SettingsError::Poisoned)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().map(|s| s.enabled).unwrap_or(false)
    }

    /// Returns true if the value changed.
    pub async fn set_enabled(&self, enabled: bool) -> Result<bool, SettingsError> {
        let changed = self.update(|s| std::mem::replace(&mut s.enabled, enabled) != enabled)?;
        if changed {
            self.save_to_disk().await?;
        }
        Ok(changed)
    }

    pub fn trusted_clients(&self) -> BTreeSet<String> {
        self.settings
            .read()
            .map(|s| s.trusted_clients.clone())
            .unwrap_or_default()
    }

    /// Replace the trusted client set.
    pub async fn set_trusted_clients(&self, clients: BTreeSet<String>) -> Result<(), SettingsError> {
        self.update(|s| {
            s.trusted_clients = clients;
            true
        })?;
        self.save_to_disk().await
    }

    /// Missing entries count as enabled.
    pub fn is_capability_enabled(&self, id: &str) -> bool {
        self.settings
            .read()
            .map(|s| s.capabilities.get(id).copied().unwrap_or(true))
            .unwrap_or(false)
    }

    /// Returns true if the value changed.
    pub async fn set_capability_enabled(&self, id: &str, enabled: bool) -> Result<bool, SettingsError> {
        let changed = self.update(|s| s.capabilities.insert(id.to_string(), enabled) != Some(enabled))?;
        if changed {
            self.save_to_disk().await?;
        }
        Ok(changed)
    }

    /// Live accessor for one capability's flag.
    pub fn capability_accessor(self: &Arc<Self>, id: &str) -> EnabledAccessor {
        let store = Arc::clone(self);
        let id = id.to_string();
        Arc::new(move || store.is_capability_enabled(&id))
    }

    /// Accessors for every id in `ids`.
    pub fn capability_bindings(self: &Arc<Self>, ids: &[String]) -> CapabilityBindings {
        ids.iter()
            .map(|id| (id.clone(), self.capability_accessor(id)))
            .collect::<HashMap<_, _>>()
    }

    /// Reload settings from disk.
    ///
    /// Used when the file was edited by hand while running.
    pub async fn reload(&self) -> Result<(), SettingsError> {
        if self.storage_path.exists() {
            let loaded = Self::load_from_path(&self.storage_path).await?;
            self.update(|s| {
                *s = loaded;
                true
            })?;
            tracing::info!("Reloaded settings from {}", self.storage_path.display());
        }
        Ok(())
    }
}
