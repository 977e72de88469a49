//! # Engine
//!
//! The patch engine is what actually rewrites code. The auto patcher only ever talks to it through
//! [`PatchEngine`]: apply one site on behalf of an owning unit, revert one applied site, or revert
//! everything an owner applied.
//!
//! [`MemoryEngine`] is the in-process implementation, writing through [`PermissionWrapper`] and
//! [`JmpHook`].

use std::collections::HashMap;

use log::{debug, trace};
use thiserror::Error;

use crate::hook::jmphook::{JmpHook, JmpHookGuard};
use crate::hook::Hook;
use crate::patcher::byte::{BytePatchGuard, BytePatcher};
use crate::patcher::mem::{PermissionError, PermissionWrapper, PermissionWrapperGuard};
use crate::patcher::Patcher;
use crate::target::{SymbolResolver, TargetDescriptor};
use crate::unit::{PatchSite, SiteAction, UnitId};

/// Receipt for one applied site
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PatchHandle {
    /// Unit that applied the patch
    pub owner: UnitId,
    /// Engine-wide sequence number, increasing in application order
    pub sequence: u64,
    /// Address that was patched
    pub address: usize,
}

/// Errors raised by a patch engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target could not be resolved to an address
    #[error("The target {0} could not be found")]
    TargetNotFound(TargetDescriptor),
    /// Memory protections could not be changed around the target
    #[error("Could not make {target} writable: {source}")]
    Protection {
        /// Target that was being patched
        target: TargetDescriptor,
        /// Error from the OS
        #[source]
        source: region::Error,
    },
    /// The underlying patcher refused the write
    #[error("The patcher rejected the write to {0}")]
    Rejected(TargetDescriptor),
    /// A unit tried to revert a patch applied by another unit
    #[error("Patch #{} belongs to {}, not {owner}", .handle.sequence, .handle.owner)]
    NotOwned {
        /// Unit asking for the revert
        owner: UnitId,
        /// Handle it passed
        handle: PatchHandle,
    },
    /// The handle is not (or no longer) applied
    #[error("Patch #{} of {} is not applied", .0.sequence, .0.owner)]
    UnknownHandle(PatchHandle),
}

/// Applies and reverts patch sites on behalf of units.
///
/// Every applied site is owned by exactly one [`UnitId`], so a unit can revert everything it did
/// without knowing about anything else.
pub trait PatchEngine {
    /// Applies a single site, recording `owner` as its owner
    fn apply(&mut self, owner: UnitId, site: &PatchSite) -> Result<PatchHandle, EngineError>;

    /// Reverts one site applied by `owner`
    fn revert(&mut self, owner: UnitId, handle: PatchHandle) -> Result<(), EngineError>;

    /// Reverts every site applied by `owner`, most recent first.
    /// Reverting an owner with nothing applied is not an error.
    fn revert_all(&mut self, owner: UnitId) -> Result<(), EngineError>;

    /// Handles currently applied by `owner`, in application order
    fn applied(&self, owner: UnitId) -> Vec<PatchHandle>;
}

/// Live guard for an applied site. Dropping it restores the original bytes.
enum AppliedPatch {
    /// Raw byte overwrite
    Bytes(PermissionWrapperGuard<BytePatchGuard>),
    /// Absolute jump to a detour
    Redirect(JmpHookGuard<PermissionWrapperGuard<BytePatchGuard>>),
}

/// Patch engine that writes into the current process' memory
pub struct MemoryEngine<R> {
    /// Turns targets into addresses
    resolver: R,
    /// Writer for [`SiteAction::Bytes`]
    patcher: PermissionWrapper<BytePatcher>,
    /// Writer for [`SiteAction::Redirect`]
    hook: JmpHook<PermissionWrapper<BytePatcher>>,
    /// Applied patches per owner, in application order
    applied: HashMap<UnitId, Vec<(PatchHandle, AppliedPatch)>>,
    /// Next sequence number to hand out
    next_sequence: u64,
}
impl<R: SymbolResolver> MemoryEngine<R> {
    /// Creates an engine that resolves targets through `resolver`
    ///
    /// # Safety
    ///
    /// Every address `resolver` returns must be valid for reads and writes of the patch written to it
    /// (the byte length for [`SiteAction::Bytes`], [`JMP_ABS_LEN`](crate::code::x64::JMP_ABS_LEN)
    /// for [`SiteAction::Redirect`]), and nothing may execute that code while it is being written.
    pub unsafe fn new(resolver: R) -> Self {
        Self {
            resolver,
            patcher: PermissionWrapper::new(BytePatcher::new()),
            hook: JmpHook::new(PermissionWrapper::new(BytePatcher::new())),
            applied: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// The resolver used for targets
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Writes `site` at `address`
    fn write(&self, address: usize, site: &PatchSite) -> Result<AppliedPatch, EngineError> {
        let map_err = |e: PermissionError<()>| match e {
            PermissionError::ProtectionError(source) => EngineError::Protection {
                target: site.target.clone(),
                source,
            },
            PermissionError::CustomError(()) => EngineError::Rejected(site.target.clone()),
        };
        // Safety: `new` makes the caller vouch for every address the resolver hands out
        unsafe {
            match &site.action {
                SiteAction::Bytes(bytes) => self
                    .patcher
                    .patch(address as *mut u8, bytes)
                    .map(AppliedPatch::Bytes)
                    .map_err(map_err),
                SiteAction::Redirect { destination } => self
                    .hook
                    .hook(address as *const u8, *destination as *const u8)
                    .map(AppliedPatch::Redirect)
                    .map_err(map_err),
            }
        }
    }
}

impl<R: SymbolResolver> PatchEngine for MemoryEngine<R> {
    fn apply(&mut self, owner: UnitId, site: &PatchSite) -> Result<PatchHandle, EngineError> {
        let address = self
            .resolver
            .resolve(&site.target)
            .ok_or_else(|| EngineError::TargetNotFound(site.target.clone()))?;

        let patch = self.write(address, site)?;
        let handle = PatchHandle {
            owner,
            sequence: self.next_sequence,
            address,
        };
        self.next_sequence += 1;

        trace!(target: "autopatch::unit", "{owner} patched {} at {address:#x}", site.target);
        self.applied.entry(owner).or_default().push((handle, patch));
        Ok(handle)
    }

    fn revert(&mut self, owner: UnitId, handle: PatchHandle) -> Result<(), EngineError> {
        if handle.owner != owner {
            return Err(EngineError::NotOwned { owner, handle });
        }
        let patches = self
            .applied
            .get_mut(&owner)
            .ok_or(EngineError::UnknownHandle(handle))?;
        let position = patches
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(EngineError::UnknownHandle(handle))?;

        // dropping the guard writes the original bytes back
        drop(patches.remove(position));
        Ok(())
    }

    fn revert_all(&mut self, owner: UnitId) -> Result<(), EngineError> {
        let Some(patches) = self.applied.remove(&owner) else {
            return Ok(());
        };
        debug!(target: "autopatch::unit", "Reverting {} patches of {owner}", patches.len());
        // newest first, so overlapping patches unwind to the original bytes
        for (_, patch) in patches.into_iter().rev() {
            match patch {
                AppliedPatch::Bytes(guard) => drop(guard),
                AppliedPatch::Redirect(guard) => drop(guard),
            }
        }
        Ok(())
    }

    fn applied(&self, owner: UnitId) -> Vec<PatchHandle> {
        self.applied
            .get(&owner)
            .map(|patches| patches.iter().map(|(h, _)| *h).collect())
            .unwrap_or_default()
    }
}
