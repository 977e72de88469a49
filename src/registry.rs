//! # Registry
//!
//! Catalog of registered patch units, one instance per [`UnitId`].
//!
//! A registry is normally built once by the host's startup code, handed to the
//! [`AutoPatcher`](crate::autopatcher::AutoPatcher), and cleared at shutdown. A process-wide
//! instance is available through [`global`] for hosts that need to reach units from detours.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use log::{debug, info};
use thiserror::Error;

use crate::engine::{PatchEngine, PatchHandle};
use crate::settings::SettingsPanel;
use crate::unit::{InstancePatcher, PatchError, PatchUnit, UnitDescriptor, UnitId, UnitType};

/// Callback fired when a unit's auto patch attempt finishes, with whether the unit is now active
pub type FinishListener = Box<dyn FnMut(bool) + Send>;

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The descriptor has no constructor
    #[error("The unit {0} is abstract and can't be registered")]
    Abstract(UnitId),
    /// The descriptor's constructor built a unit with another identity
    #[error("The constructor registered for {expected} built the unit {found}")]
    IdentityMismatch {
        /// Identity of the descriptor
        expected: UnitId,
        /// Identity reported by the built unit
        found: UnitId,
    },
    /// The identity is taken
    #[error("The unit {0} has already been registered")]
    AlreadyRegistered(UnitId),
    /// Nothing is registered under the identity
    #[error("The unit {0} is not registered")]
    NotRegistered(UnitId),
    /// The registered unit is not of the requested type
    #[error("The unit {0} is not of the requested type")]
    TypeMismatch(UnitId),
    /// Manually patching a unit failed
    #[error("Patching {unit} failed: {source}")]
    Patch {
        /// Unit being patched
        unit: UnitId,
        /// Cause
        #[source]
        source: PatchError,
    },
    /// Reverting a unit failed
    #[error("Reverting {unit} failed: {source}")]
    Revert {
        /// Unit being reverted
        unit: UnitId,
        /// Cause
        #[source]
        source: PatchError,
    },
}

/// Registered unit and the state the registry keeps for it
pub(crate) struct UnitSlot {
    /// Singleton instance
    pub(crate) unit: Box<dyn PatchUnit>,
    /// Whether the unit's patches are currently applied
    pub(crate) active: bool,
    /// Completion listeners
    pub(crate) listeners: Vec<FinishListener>,
}
impl UnitSlot {
    /// The unit as a trait object.
    ///
    /// Goes through the box so [`AsAny`](crate::unit::AsAny) resolves to the unit, not the box.
    pub(crate) fn unit(&self) -> &dyn PatchUnit {
        self.unit.as_ref()
    }

    /// Records the outcome of an attempt and notifies every listener once
    pub(crate) fn finish(&mut self, active: bool) {
        self.active = active;
        for listener in &mut self.listeners {
            listener(active);
        }
    }
}

/// Catalog of patch units keyed by identity
#[derive(Default)]
pub struct PatchRegistry {
    /// Units by identity
    slots: HashMap<UnitId, UnitSlot>,
    /// Identities in registration order, used to break ordering ties
    order: Vec<UnitId>,
}
impl PatchRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and stores the unit described by `descriptor`
    pub fn register_patch_class(
        &mut self,
        descriptor: UnitDescriptor,
    ) -> Result<(), RegistryError> {
        let id = descriptor.id();
        let factory = descriptor.factory().ok_or(RegistryError::Abstract(id))?;
        if self.slots.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }

        let unit = factory();
        if unit.id() != id {
            return Err(RegistryError::IdentityMismatch {
                expected: id,
                found: unit.id(),
            });
        }

        debug!(target: "autopatch::loading", "Registered patch unit {id}");
        self.slots.insert(
            id,
            UnitSlot {
                unit,
                active: false,
                listeners: Vec::new(),
            },
        );
        self.order.push(id);
        Ok(())
    }

    /// Registers every descriptor in order. Returns `false` when there was nothing to register.
    pub fn register_all<I>(&mut self, descriptors: I) -> Result<bool, RegistryError>
    where
        I: IntoIterator<Item = UnitDescriptor>,
    {
        let mut any = false;
        for descriptor in descriptors {
            self.register_patch_class(descriptor)?;
            any = true;
        }
        Ok(any)
    }

    /// Removes a unit, reverting its patches first if it is active.
    /// If the revert fails the unit stays registered.
    pub fn unregister_patch_class(
        &mut self,
        id: UnitId,
        engine: &mut dyn PatchEngine,
    ) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(RegistryError::NotRegistered(id))?;

        if slot.active {
            let mut patcher = InstancePatcher::new(id, engine);
            slot.unit
                .unpatch_instance(&mut patcher)
                .map_err(|source| RegistryError::Revert { unit: id, source })?;
            slot.active = false;
        }

        self.slots.remove(&id);
        self.order.retain(|o| *o != id);
        debug!(target: "autopatch::loading", "Unregistered patch unit {id}");
        Ok(())
    }

    /// Typed lookup
    pub fn get_instance<T: UnitType>(&self) -> Result<&T, RegistryError> {
        self.slot(T::ID)?
            .unit()
            .as_any()
            .downcast_ref()
            .ok_or(RegistryError::TypeMismatch(T::ID))
    }

    /// Typed mutable lookup
    pub fn get_instance_mut<T: UnitType>(&mut self) -> Result<&mut T, RegistryError> {
        self.slots
            .get_mut(&T::ID)
            .ok_or(RegistryError::NotRegistered(T::ID))?
            .unit
            .as_mut()
            .as_any_mut()
            .downcast_mut()
            .ok_or(RegistryError::TypeMismatch(T::ID))
    }

    /// Untyped lookup
    pub fn get_abstract_instance(&self, id: UnitId) -> Result<&dyn PatchUnit, RegistryError> {
        self.slot(id).map(UnitSlot::unit)
    }

    /// Every registered unit, in registration order
    pub fn get_registered_auto_patches(
        &self,
    ) -> impl Iterator<Item = (UnitId, &dyn PatchUnit)> + '_ {
        self.order
            .iter()
            .filter_map(move |id| self.slots.get(id).map(|slot| (*id, slot.unit())))
    }

    /// Identities in registration order
    pub fn ids(&self) -> Vec<UnitId> {
        self.order.clone()
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: UnitId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Number of registered units
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the unit's patches are currently applied
    pub fn is_patch_active(&self, id: UnitId) -> Result<bool, RegistryError> {
        self.slot(id).map(|slot| slot.active)
    }

    /// Subscribes to the end of the unit's auto patch attempts
    pub fn on_patch_finished<F>(&mut self, id: UnitId, listener: F) -> Result<(), RegistryError>
    where
        F: FnMut(bool) + Send + 'static,
    {
        self.slot_mut(id)
            .ok_or(RegistryError::NotRegistered(id))?
            .listeners
            .push(Box::new(listener));
        Ok(())
    }

    /// Makes a setting visible only while the unit is active.
    ///
    /// The setting is hidden right away and shown once an attempt leaves the unit active.
    pub fn set_setting_patch_dependence(
        &mut self,
        id: UnitId,
        panel: &SettingsPanel,
        key: &str,
    ) -> Result<(), RegistryError> {
        if !self.contains(id) {
            return Err(RegistryError::NotRegistered(id));
        }
        panel.set_browsable(key, false);

        let panel = panel.clone();
        let key = key.to_string();
        self.on_patch_finished(id, move |active| panel.set_browsable(&key, active))
    }

    /// Patches a unit outside the auto patcher, keeping its active flag correct.
    /// Listeners are not notified.
    pub fn patch_unit(
        &mut self,
        id: UnitId,
        engine: &mut dyn PatchEngine,
    ) -> Result<Vec<PatchHandle>, RegistryError> {
        let slot = self.slot_mut(id).ok_or(RegistryError::NotRegistered(id))?;
        let mut patcher = InstancePatcher::new(id, engine);
        let handles = slot
            .unit
            .patch_instance(&mut patcher)
            .map_err(|source| RegistryError::Patch { unit: id, source })?;
        slot.active = true;
        Ok(handles)
    }

    /// Reverts a unit outside the auto patcher, keeping its active flag correct
    pub fn unpatch_unit(
        &mut self,
        id: UnitId,
        engine: &mut dyn PatchEngine,
    ) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id).ok_or(RegistryError::NotRegistered(id))?;
        let mut patcher = InstancePatcher::new(id, engine);
        slot.unit
            .unpatch_instance(&mut patcher)
            .map_err(|source| RegistryError::Revert { unit: id, source })?;
        slot.active = false;
        Ok(())
    }

    /// Drops every unit and listener without reverting anything
    pub fn clear(&mut self) {
        if !self.is_empty() {
            info!(target: "autopatch::loading", "Clearing {} registered patch units", self.len());
        }
        self.slots.clear();
        self.order.clear();
    }

    /// Slot lookup
    fn slot(&self, id: UnitId) -> Result<&UnitSlot, RegistryError> {
        self.slots.get(&id).ok_or(RegistryError::NotRegistered(id))
    }

    /// Mutable slot lookup for the auto patcher
    pub(crate) fn slot_mut(&mut self, id: UnitId) -> Option<&mut UnitSlot> {
        self.slots.get_mut(&id)
    }
}

lazy_static! {
    /// Process-wide registry
    static ref GLOBAL: Mutex<PatchRegistry> = Mutex::new(PatchRegistry::new());
}

/// Locks the process-wide registry, creating it on first use.
///
/// Meant for a single startup phase; holding the guard across an auto patch run is expected.
pub fn global() -> MutexGuard<'static, PatchRegistry> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the process-wide registry. Call at plugin shutdown or in test teardown.
pub fn reset_global() {
    global().clear();
}
