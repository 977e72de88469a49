//! Plain byte patcher for writable memory

use std::ptr;

use super::{PatchGuard, Patcher};

/// Overwrites a location with a byte slice, keeping a copy of what was there.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = ();
    type Guard<'a> = BytePatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Bytes that were at `location` before the patch
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        let mut original = vec![0u8; patch.len()];
        ptr::copy_nonoverlapping(location, original.as_mut_ptr(), patch.len());

        let guard = Self { original, location };
        ptr::copy_nonoverlapping(patch.as_ptr(), location, patch.len());

        guard
    }

    /// Bytes that will be written back when the guard drops
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    fn location(&self) -> *const u8 {
        self.location
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe {
            ptr::copy_nonoverlapping(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}
