//! Durable session settings
//!
//! Holds the tunnel parameters last requested by the user and the region
//! list last reported by the engine, so both survive process restarts.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Parameters the engine is started with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelParameters {
    /// Requested egress region; empty means best available
    #[serde(default)]
    pub egress_region: String,
}

impl TunnelParameters {
    pub fn new(egress_region: impl Into<String>) -> Self {
        Self {
            egress_region: egress_region.into(),
        }
    }

    /// Whether switching from `self` to `other` needs an engine restart
    ///
    /// Only the egress region is compared.
    pub fn requires_restart(&self, other: &TunnelParameters) -> bool {
        self.egress_region != other.egress_region
    }
}

/// Durable settings storage
pub trait SettingsStore: Send + Sync {
    fn load_stored_parameters(&self) -> Result<Option<TunnelParameters>>;

    /// Persist `params`; returns whether they differ from what was stored
    fn store_parameters(&self, params: &TunnelParameters) -> Result<bool>;

    fn load_available_regions(&self) -> Result<Option<Vec<String>>>;

    fn store_available_regions(&self, regions: &[String]) -> Result<()>;
}

/// On-disk layout of [`FileSettingsStore`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    available_regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameters: Option<TunnelParameters>,
}

/// Settings kept in a TOML file
#[derive(Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettingsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SettingsFile> {
        if !self.path.exists() {
            return Ok(SettingsFile::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            VpnError::Settings(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        toml::from_str(&contents).map_err(|e| {
            VpnError::Settings(format!("Failed to parse {}: {e}", self.path.display()))
        })
    }

    fn write(&self, file: &SettingsFile) -> Result<()> {
        let contents = toml::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Write to a sibling file first so readers never see a partial file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents).map_err(|e| {
            VpnError::Settings(format!("Failed to write {}: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            VpnError::Settings(format!("Failed to replace {}: {e}", self.path.display()))
        })
    }

    fn update<T>(&self, f: impl FnOnce(&mut SettingsFile) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.read()?;
        let before = file.clone();
        let result = f(&mut file);
        if file != before {
            self.write(&file)?;
        }
        Ok(result)
    }
}

impl SettingsStore for FileSettingsStore {
    fn load_stored_parameters(&self) -> Result<Option<TunnelParameters>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.parameters)
    }

    fn store_parameters(&self, params: &TunnelParameters) -> Result<bool> {
        self.update(|file| {
            let changed = file.parameters.as_ref() != Some(params);
            file.parameters = Some(params.clone());
            changed
        })
    }

    fn load_available_regions(&self) -> Result<Option<Vec<String>>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.available_regions)
    }

    fn store_available_regions(&self, regions: &[String]) -> Result<()> {
        self.update(|file| file.available_regions = Some(regions.to_vec()))
    }
}

/// Settings held in memory only
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<SettingsFile>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `params`
    pub fn with_parameters(params: TunnelParameters) -> Self {
        Self {
            inner: Mutex::new(SettingsFile {
                parameters: Some(params),
                available_regions: None,
            }),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_stored_parameters(&self) -> Result<Option<TunnelParameters>> {
        Ok(self.lock().parameters.clone())
    }

    fn store_parameters(&self, params: &TunnelParameters) -> Result<bool> {
        let mut inner = self.lock();
        let changed = inner.parameters.as_ref() != Some(params);
        inner.parameters = Some(params.clone());
        Ok(changed)
    }

    fn load_available_regions(&self) -> Result<Option<Vec<String>>> {
        Ok(self.lock().available_regions.clone())
    }

    fn store_available_regions(&self, regions: &[String]) -> Result<()> {
        self.lock().available_regions = Some(regions.to_vec());
        Ok(())
    }
}

impl MemorySettingsStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, SettingsFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
