//! Scope guards over a [`Hook`].
//!
//! [`ScopedInstall`] keeps a hook installed for as long as it lives.
//! [`ScopedRemove`] takes it out for a nested scope, typically inside the
//! replacement itself so that it can call the real function.

use crate::diagnostics;
use crate::interceptor::Hook;
use crate::registry::Registration;
use crate::types::{HookError, Result};
use core::ffi::c_void;
use std::sync::Arc;

/// Installs a hook on construction and removes it on drop.
///
/// A guard created over a registration that already had an installed hook
/// shadows it instead: it swaps in the new replacement and, on drop, puts the
/// previous one back.
#[must_use = "the hook is removed when the guard is dropped"]
#[derive(Debug)]
pub struct ScopedInstall {
    hook: Arc<Hook>,
    shadowed: Option<usize>,
    registration: Option<&'static Registration>,
}

impl ScopedInstall {
    /// Install `hook` for the lifetime of the returned guard.
    pub fn new(hook: Arc<Hook>) -> Result<Self> {
        hook.install()?;
        Ok(Self {
            hook,
            shadowed: None,
            registration: None,
        })
    }

    /// Hook `target` with `replacement` for the lifetime of the returned guard.
    ///
    /// # Safety
    /// See [`Hook::new`].
    pub unsafe fn hook_address(target: *const c_void, replacement: *const c_void) -> Result<Self> {
        Self::new(Hook::new(target, replacement)?)
    }

    pub(crate) fn owned_by(mut self, registration: &'static Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    pub(crate) fn shadowing(hook: Arc<Hook>, previous: *const c_void, registration: &'static Registration) -> Self {
        Self {
            hook,
            shadowed: Some(previous as usize),
            registration: Some(registration),
        }
    }

    pub fn hook(&self) -> &Arc<Hook> {
        &self.hook
    }

    /// Swap the replacement while staying installed.
    ///
    /// # Safety
    /// `replacement` must have the target's ABI and signature.
    pub unsafe fn replace(&self, replacement: *const c_void) -> Result<()> {
        self.hook.replace(replacement)
    }

    /// Callable entry with the unhooked behavior.
    pub fn original(&self) -> *const c_void {
        self.hook.original()
    }
}

impl Drop for ScopedInstall {
    fn drop(&mut self) {
        let target = self.hook.target() as usize;
        if let Some(previous) = self.shadowed {
            if let Err(e) = unsafe { self.hook.retarget(previous as *const c_void) } {
                diagnostics::report(target, "unshadow", e);
            }
            return;
        }
        if let Err(e) = self.hook.remove() {
            diagnostics::report(target, "remove", e);
        }
        if let Some(registration) = self.registration {
            registration.release(&self.hook);
        }
    }
}

/// Removes an installed hook on construction and reinstalls it, with the same
/// replacement, on drop.
///
/// Two removers over the same hook must nest, never overlap.
#[must_use = "the hook is reinstalled when the guard is dropped"]
#[derive(Debug)]
pub struct ScopedRemove {
    hook: Arc<Hook>,
    armed: bool,
}

impl ScopedRemove {
    /// Fails with [`HookError::DoubleRemove`] if the hook is not currently installed.
    pub fn new(hook: Arc<Hook>) -> Result<Self> {
        hook.remove().map_err(|e| match e {
            HookError::NotInstalled => HookError::DoubleRemove,
            e => e,
        })?;
        log::trace!("scope: 0x{:x} removed for nested scope", hook.target() as usize);
        Ok(Self { hook, armed: true })
    }

    /// Reinstall now and report the outcome instead of leaving it to drop.
    pub fn reinstall(mut self) -> Result<()> {
        self.armed = false;
        Self::restore(&self.hook)
    }

    fn restore(hook: &Hook) -> Result<()> {
        hook.install().map_err(|e| match e {
            HookError::AlreadyInstalled => HookError::DoubleReinstall,
            e => e,
        })
    }

    pub fn hook(&self) -> &Arc<Hook> {
        &self.hook
    }
}

impl Drop for ScopedRemove {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = Self::restore(&self.hook) {
            diagnostics::report(self.hook.target() as usize, "reinstall", e);
        }
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::interceptor::tests::make_add_const;

    #[test]
    fn install_guard_removes_on_drop() {
        let _g = crate::lock_hook_tests();

        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(100);
        {
            let guard = unsafe { ScopedInstall::hook_address(f as *const c_void, r as *const c_void) }.unwrap();
            assert_eq!(f(1), 101);
            assert!(guard.hook().is_installed());
        }
        assert_eq!(f(1), 2);
        assert!(!crate::Interceptor::obtain().is_hooked(f as *const c_void));
    }

    #[test]
    fn install_guard_replace() {
        let _g = crate::lock_hook_tests();

        let (_f_mem, f) = make_add_const(1);
        let (_r1_mem, r1) = make_add_const(100);
        let (_r2_mem, r2) = make_add_const(200);
        {
            let guard = unsafe { ScopedInstall::hook_address(f as *const c_void, r1 as *const c_void) }.unwrap();
            assert_eq!(f(0), 100);
            unsafe { guard.replace(r2 as *const c_void) }.unwrap();
            assert_eq!(f(0), 200);
        }
        assert_eq!(f(0), 1);
    }

    #[test]
    fn remove_guard_nesting_law() {
        let _g = crate::lock_hook_tests();

        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(100);
        let guard = unsafe { ScopedInstall::hook_address(f as *const c_void, r as *const c_void) }.unwrap();

        for _ in 0..3 {
            assert_eq!(f(1), 101);
            {
                let _removed = ScopedRemove::new(guard.hook().clone()).unwrap();
                assert_eq!(f(1), 2);
            }
            assert_eq!(f(1), 101);
        }
    }

    #[test]
    fn overlapping_removers_fail_fast() {
        let _g = crate::lock_hook_tests();

        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(100);
        let guard = unsafe { ScopedInstall::hook_address(f as *const c_void, r as *const c_void) }.unwrap();

        let outer = ScopedRemove::new(guard.hook().clone()).unwrap();
        let inner = ScopedRemove::new(guard.hook().clone());
        assert_eq!(inner.unwrap_err(), HookError::DoubleRemove);

        // Someone reinstalled behind the remover's back.
        guard.hook().install().unwrap();
        assert_eq!(outer.reinstall(), Err(HookError::DoubleReinstall));
        assert_eq!(f(1), 101);
    }

    #[test]
    fn reinstall_conflict_on_drop_goes_to_sink() {
        let _g = crate::lock_hook_tests();

        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(100);
        let guard = unsafe { ScopedInstall::hook_address(f as *const c_void, r as *const c_void) }.unwrap();
        let target = f as usize;

        let removed = ScopedRemove::new(guard.hook().clone()).unwrap();
        guard.hook().install().unwrap();
        drop(removed);

        let reports = diagnostics::take_for(target);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error, HookError::DoubleReinstall);
        assert!(!diagnostics::is_degraded(target));
    }
}
