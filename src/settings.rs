//! # Settings
//!
//! Bridge to the host's configuration UI. Settings that only make sense while a patch unit is
//! active can be hidden until that unit has been patched, see
//! [`PatchRegistry::set_setting_patch_dependence`](crate::registry::PatchRegistry::set_setting_patch_dependence).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

/// State of one setting as shown in the configuration UI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingState {
    /// Section the setting is listed under
    pub section: String,
    /// Help text
    pub description: String,
    /// Whether the UI lists the setting
    pub browsable: bool,
}

/// Shared table of settings and their visibility.
///
/// Cloning gives another handle to the same table.
#[derive(Clone, Default, Debug)]
pub struct SettingsPanel {
    /// Settings by key
    settings: Arc<Mutex<BTreeMap<String, SettingState>>>,
}
impl SettingsPanel {
    /// Creates an empty panel
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the table
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, SettingState>> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a visible setting, replacing any setting with the same key
    pub fn add_setting(&self, section: &str, key: &str, description: &str) {
        self.lock().insert(
            key.to_string(),
            SettingState {
                section: section.to_string(),
                description: description.to_string(),
                browsable: true,
            },
        );
    }

    /// Shows or hides a setting. Settings not added yet are created in an unnamed section.
    pub fn set_browsable(&self, key: &str, browsable: bool) {
        trace!(target: "autopatch::loading", "Setting \"{key}\" browsable: {browsable}");
        self.lock()
            .entry(key.to_string())
            .or_insert_with(|| SettingState {
                section: String::new(),
                description: String::new(),
                browsable,
            })
            .browsable = browsable;
    }

    /// Whether a setting is listed, `None` if unknown
    pub fn is_browsable(&self, key: &str) -> Option<bool> {
        self.lock().get(key).map(|s| s.browsable)
    }

    /// Snapshot of one setting
    pub fn get(&self, key: &str) -> Option<SettingState> {
        self.lock().get(key).cloned()
    }

    /// Keys of every listed setting, sorted
    pub fn visible_settings(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, s)| s.browsable)
            .map(|(k, _)| k.clone())
            .collect()
    }
}
