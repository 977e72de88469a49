//! # Unit
//!
//! A patch unit groups every patch needed for one feature so the feature can be enabled, disabled
//! and rolled back as a whole.
//!
//! A unit describes its patches as a tree of [`PatchScope`]s. Each scope holds [`PatchSite`]s and
//! may nest further scopes; an [`Ignore`] marker on a scope leaves out its own sites, or the scope
//! and everything under it. [`InstancePatcher`] walks that tree against a [`PatchEngine`].

use std::any::Any;
use std::fmt::{self, Display};

use log::trace;
use thiserror::Error;

use crate::engine::{EngineError, PatchEngine, PatchHandle};
use crate::target::TargetDescriptor;

/// Stable identity of a patch unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(&'static str);
impl UnitId {
    /// Creates an id from a unique name
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Name the id was created with
    pub const fn name(self) -> &'static str {
        self.0
    }
}
impl Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Before/after declarations relative to other units
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchOrder {
    /// Units that must be patched after this one
    pub before: Vec<UnitId>,
    /// Units that must be patched before this one
    pub after: Vec<UnitId>,
}
impl PatchOrder {
    /// No constraints
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch ahead of `unit`
    pub fn before(mut self, unit: UnitId) -> Self {
        self.before.push(unit);
        self
    }

    /// Patch behind `unit`
    pub fn after(mut self, unit: UnitId) -> Self {
        self.after.push(unit);
        self
    }

    /// True when nothing is declared
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Adds all of `other`'s declarations to this one
    pub fn merge(&mut self, other: &PatchOrder) {
        self.before.extend_from_slice(&other.before);
        self.after.extend_from_slice(&other.after);
    }
}

/// What to write at a site
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SiteAction {
    /// Overwrite the target with these bytes
    Bytes(Vec<u8>),
    /// Redirect the target to a detour with an absolute jump
    Redirect {
        /// Address of the detour
        destination: usize,
    },
}

/// One patch: a target, what to do to it, and optional ordering declarations.
///
/// Site declarations are folded into the owning unit's order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchSite {
    /// Method to patch
    pub target: TargetDescriptor,
    /// Patch to write
    pub action: SiteAction,
    /// Ordering declared on this site
    pub order: PatchOrder,
}
impl PatchSite {
    /// Overwrites `target` with `bytes`
    pub fn bytes(target: TargetDescriptor, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            target,
            action: SiteAction::Bytes(bytes.into()),
            order: PatchOrder::default(),
        }
    }

    /// Redirects `target` to `destination`
    pub fn redirect(target: TargetDescriptor, destination: usize) -> Self {
        Self {
            target,
            action: SiteAction::Redirect { destination },
            order: PatchOrder::default(),
        }
    }

    /// Attaches ordering declarations to the site
    pub fn with_order(mut self, order: PatchOrder) -> Self {
        self.order = order;
        self
    }
}

/// Exclusion marker for a scope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Ignore {
    /// Patch the scope and recurse into nested scopes
    #[default]
    None,
    /// Skip the scope's own sites but still recurse into nested scopes
    SelfOnly,
    /// Skip the scope and its entire subtree
    SelfAndNested,
}

/// Node of a unit's patch tree
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchScope {
    /// Name, unique among the unit's scopes
    pub name: String,
    /// Exclusion marker
    pub ignore: Ignore,
    /// Sites applied when this scope is patched
    pub sites: Vec<PatchSite>,
    /// Nested scopes
    pub nested: Vec<PatchScope>,
}
impl PatchScope {
    /// Creates an empty scope
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a site
    pub fn site(mut self, site: PatchSite) -> Self {
        self.sites.push(site);
        self
    }

    /// Adds a nested scope
    pub fn nested(mut self, scope: PatchScope) -> Self {
        self.nested.push(scope);
        self
    }

    /// Sets the exclusion marker
    pub fn ignore(mut self, ignore: Ignore) -> Self {
        self.ignore = ignore;
        self
    }

    /// Finds a scope below this one by name
    pub fn find_nested(&self, name: &str) -> Option<&PatchScope> {
        self.nested
            .iter()
            .find_map(|s| if s.name == name { Some(s) } else { s.find_nested(name) })
    }

    /// Sites that patching this scope would apply, in patch order
    pub fn patchable_sites(&self) -> Vec<&PatchSite> {
        let mut sites = Vec::new();
        self.collect_sites(&mut sites);
        sites
    }

    /// Depth-first walk honoring ignore markers
    fn collect_sites<'a>(&'a self, sites: &mut Vec<&'a PatchSite>) {
        match self.ignore {
            Ignore::SelfAndNested => {
                trace!(
                    target: "autopatch::unit",
                    "Skipping scope {} and its nested scopes",
                    self.name
                );
                return;
            }
            Ignore::SelfOnly => {
                trace!(target: "autopatch::unit", "Skipping the sites of scope {}", self.name);
            }
            Ignore::None => sites.extend(self.sites.iter()),
        }
        for nested in &self.nested {
            nested.collect_sites(sites);
        }
    }
}

/// Errors from patching or unpatching a unit
#[derive(Debug, Error)]
pub enum PatchError {
    /// The engine failed
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// A nested scope was requested that the unit doesn't have
    #[error("The scope \"{scope}\" is not nested in {owner}")]
    ScopeNotFound {
        /// Unit that was searched
        owner: UnitId,
        /// Requested scope
        scope: String,
    },
    /// The root scope was requested through the nested scope API
    #[error("\"{0}\" is the root scope of its unit, patch it with patch_instance")]
    OwnScope(String),
    /// Failure reported by a unit's own patch logic
    #[error("{0}")]
    Custom(String),
    /// The unit's patch logic panicked
    #[error("Patching panicked: {0}")]
    Panicked(String),
}

/// Patches a unit's scopes through an engine, owning everything it applies as `owner`
pub struct InstancePatcher<'e> {
    /// Unit the patches are applied for
    owner: UnitId,
    /// Engine doing the writes
    engine: &'e mut dyn PatchEngine,
}
impl<'e> InstancePatcher<'e> {
    /// Creates a patcher for `owner`
    pub fn new(owner: UnitId, engine: &'e mut dyn PatchEngine) -> Self {
        Self { owner, engine }
    }

    /// Unit the patches are applied for
    pub fn owner(&self) -> UnitId {
        self.owner
    }

    /// Applies every patchable site of `root`. Stops at the first failure, leaving the sites
    /// applied so far in place.
    pub fn patch_scope(&mut self, root: &PatchScope) -> Result<Vec<PatchHandle>, PatchError> {
        root.patchable_sites()
            .into_iter()
            .map(|site| self.patch_site(site))
            .collect()
    }

    /// Applies one site
    pub fn patch_site(&mut self, site: &PatchSite) -> Result<PatchHandle, PatchError> {
        Ok(self.engine.apply(self.owner, site)?)
    }

    /// Applies a single scope nested somewhere under `root`, for units that patch parts of
    /// themselves manually
    pub fn patch_nested_scope(
        &mut self,
        root: &PatchScope,
        name: &str,
    ) -> Result<Vec<PatchHandle>, PatchError> {
        if root.name == name {
            return Err(PatchError::OwnScope(name.to_string()));
        }
        let scope = root
            .find_nested(name)
            .ok_or_else(|| PatchError::ScopeNotFound {
                owner: self.owner,
                scope: name.to_string(),
            })?;
        self.patch_scope(scope)
    }

    /// Reverts one site this unit applied
    pub fn unpatch_site(&mut self, handle: PatchHandle) -> Result<(), PatchError> {
        Ok(self.engine.revert(self.owner, handle)?)
    }

    /// Reverts everything this unit applied
    pub fn unpatch_all(&mut self) -> Result<(), PatchError> {
        Ok(self.engine.revert_all(self.owner)?)
    }

    /// Sites currently applied for this unit
    pub fn applied(&self) -> Vec<PatchHandle> {
        self.engine.applied(self.owner)
    }
}

/// Access to the concrete type behind a `dyn PatchUnit`
pub trait AsAny: Any {
    /// Upcast to [`Any`]
    fn as_any(&self) -> &dyn Any;
    /// Mutable upcast to [`Any`]
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A self-contained group of patches that is enabled, patched and rolled back as a whole.
///
/// Whether the unit is currently active is tracked by the
/// [`PatchRegistry`](crate::registry::PatchRegistry), not by the unit.
pub trait PatchUnit: AsAny + Send {
    /// Identity of the unit
    fn id(&self) -> UnitId;

    /// Whether the auto patcher should try to patch this unit. When false it is skipped.
    fn is_auto_patch_enabled(&self) -> bool;

    /// Whether a failed auto patch attempt reverts whatever the attempt already applied
    fn is_rollback_on_auto_patch_fail(&self) -> bool {
        true
    }

    /// Message shown to the end user when the auto patch attempt fails
    fn failure_message(&self) -> &str;

    /// Unit-level ordering declarations
    fn order(&self) -> PatchOrder {
        PatchOrder::default()
    }

    /// The unit's patch tree
    fn scope(&self) -> PatchScope;

    /// Applies the unit. Calling this twice without an unpatch in between is not guarded against.
    fn patch_instance(
        &mut self,
        patcher: &mut InstancePatcher<'_>,
    ) -> Result<Vec<PatchHandle>, PatchError> {
        patcher.patch_scope(&self.scope())
    }

    /// Reverts everything the unit applied
    fn unpatch_instance(&mut self, patcher: &mut InstancePatcher<'_>) -> Result<(), PatchError> {
        patcher.unpatch_all()
    }
}

/// A unit with a compile-time identity, constructible with [`Default`]
pub trait UnitType: PatchUnit + Default {
    /// Identity shared by every instance of the type
    const ID: UnitId;
}

/// Builds the singleton instance of a unit
pub type UnitFactory = fn() -> Box<dyn PatchUnit>;

/// Registration entry for a unit
#[derive(Clone, Copy, Debug)]
pub struct UnitDescriptor {
    /// Identity the unit is registered under
    id: UnitId,
    /// Constructor, `None` for abstract units
    factory: Option<UnitFactory>,
}
impl UnitDescriptor {
    /// Descriptor for a typed unit
    pub fn of<T: UnitType>() -> Self {
        /// Monomorphized constructor for `T`
        fn build<T: UnitType>() -> Box<dyn PatchUnit> {
            Box::new(T::default())
        }
        Self {
            id: T::ID,
            factory: Some(build::<T>),
        }
    }

    /// Descriptor with a custom constructor
    pub fn from_factory(id: UnitId, factory: UnitFactory) -> Self {
        Self {
            id,
            factory: Some(factory),
        }
    }

    /// Descriptor for a unit that has no constructor of its own. Registering it fails.
    pub fn abstract_unit(id: UnitId) -> Self {
        Self { id, factory: None }
    }

    /// Identity of the described unit
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Constructor, `None` for abstract units
    pub fn factory(&self) -> Option<UnitFactory> {
        self.factory
    }
}
