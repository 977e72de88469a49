//! This module contains a patcher which adjusts memory permissions to patch read-only data

use log::error;
use region::Protection;
use thiserror::Error;

use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}
impl From<()> for PermissionError<()> {
    fn from(e: ()) -> Self {
        Self::CustomError(e)
    }
}

/// Wraps a patcher so it can write to memory that's normally unwritable, such as code pages.
/// The target pages are made writable for the duration of the write and flipped back afterwards,
/// on patch and again on restore.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;
    type Guard<'a> = PermissionWrapperGuard<P::Guard<'a>> where Self: 'a;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let _guard = region::protect_with_handle(location, patch.len(), Protection::all())?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, patch.len()))
            .map_err(Into::into)
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, len: usize) -> Self {
        Self {
            guard: Some(guard),
            len,
        }
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    fn location(&self) -> *const u8 {
        self.guard
            .as_ref()
            .map_or(std::ptr::null(), PatchGuard::location)
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(inner) = self.guard.take() else {
            return;
        };
        let location = inner.location();
        match unsafe { region::protect_with_handle(location, self.len, Protection::all()) } {
            Ok(_handle) => inner.restore(),
            Err(e) => {
                // the bytes stay patched; writing without permission would fault
                error!(
                    target: "autopatch::unit",
                    "Could not unprotect {location:p} to restore a patch: {e}"
                );
                std::mem::forget(inner);
            }
        }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into [`PermissionWrapper`].
///
/// # Safety
///
/// This does not change memory permissions. The result must only be written through [`PermissionWrapper`].
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}
