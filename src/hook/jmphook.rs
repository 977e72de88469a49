//! # Jump Hook
//!
//! This hook type uses a basic `jmp` instruction to redirect execution

use crate::{
    code::x64::jmp_abs,
    patcher::{PatchGuard, Patcher},
};

use super::{Hook, HookGuard};

/// Simple jmp hook
pub struct JmpHook<P> {
    /// Underlying patcher to be used to hook
    patcher: P,
}
impl<P: Patcher> JmpHook<P> {
    /// Creates a new jmp hook
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}
unsafe impl<P: Patcher> Hook for JmpHook<P> {
    type Error = P::Error;
    type Guard<'a> = JmpHookGuard<P::Guard<'a>>
    where
        Self: 'a;

    unsafe fn hook(
        &self,
        source: *const u8,
        destination: *const u8,
    ) -> Result<Self::Guard<'_>, Self::Error> {
        // patch with an absolute jmp to the destination
        let patch = self
            .patcher
            .patch(source as _, &jmp_abs(destination as _))?;

        Ok(JmpHookGuard::new(patch))
    }
}

/// Guard for jmp hooks
pub struct JmpHookGuard<G: PatchGuard> {
    /// Underlying patch guard that we're wrapping
    guard: G,
}
impl<G: PatchGuard> JmpHookGuard<G> {
    /// Creates a new jmp hook guard that wraps `guard`
    fn new(guard: G) -> Self {
        Self { guard }
    }
    /// Get the underlying patch guard in case info is needed
    pub fn patch(&self) -> &G {
        &self.guard
    }
}
unsafe impl<G: PatchGuard> HookGuard for JmpHookGuard<G> {}

#[cfg(test)]
mod tests {
    use std::slice;

    use crate::code::x64::{jmp_abs, JMP_ABS_LEN};
    use crate::hook::{Hook, HookGuard};
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::PatchGuard;

    use super::JmpHook;

    #[test]
    /// The hooked bytes hold the jump and go back to the original bytes on unhook
    fn test_hook_and_unhook() {
        let mut code = vec![0x90u8; JMP_ABS_LEN + 2];
        let ptr = code.as_mut_ptr();
        let destination = 0xdead_beef_usize as *const u8;

        let hook = JmpHook::new(BytePatcher::new());
        let guard = unsafe { hook.hook(ptr, destination).unwrap() };

        assert_eq!(guard.patch().location(), ptr as *const u8);
        assert_eq!(
            unsafe { slice::from_raw_parts(ptr, JMP_ABS_LEN) },
            jmp_abs(0xdead_beef)
        );
        // bytes past the jump are left alone
        assert_eq!(unsafe { *ptr.add(JMP_ABS_LEN) }, 0x90);

        guard.unhook();

        assert!(code.iter().all(|b| *b == 0x90));
    }
}
