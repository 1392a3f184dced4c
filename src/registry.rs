//! Hookable function declarations and the process-wide table that finds them
//! by name.
//!
//! Declarations self-register on first use (or explicitly through
//! [`Registration::register`]). Live hooks are tracked per target address, so
//! a hook and a mock declared separately for the same function share one
//! patch: whichever was installed last receives the calls, and ending its
//! scope hands them back to the one installed before it.

use crate::interceptor::Hook;
use crate::scoped::{ScopedInstall, ScopedRemove};
use crate::signature::Signature;
use crate::types::{HookError, Result};
use core::ffi::c_void;
use core::marker::PhantomData;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock};

#[derive(Default)]
struct Table {
    names: HashMap<&'static str, &'static Registration>,
    active: HashMap<usize, Arc<Hook>>,
}

fn table() -> MutexGuard<'static, Table> {
    static TABLE: OnceLock<Mutex<Table>> = OnceLock::new();
    TABLE
        .get_or_init(|| Mutex::new(Table::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Static metadata of one hookable function.
pub struct Registration {
    name: &'static str,
    signature: &'static str,
    arity: usize,
    resolve: fn() -> *const c_void,
    registered: Once,
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("arity", &self.arity)
            .finish()
    }
}

impl Registration {
    pub const fn new(name: &'static str, signature: &'static str, arity: usize, resolve: fn() -> *const c_void) -> Self {
        Self {
            name,
            signature,
            arity,
            resolve,
            registered: Once::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn signature(&self) -> &'static str {
        self.signature
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn address(&self) -> *const c_void {
        (self.resolve)()
    }

    /// Make this declaration visible to the name-keyed functions. Idempotent.
    pub fn register(&'static self) {
        self.registered.call_once(|| {
            let mut t = table();
            match t.names.get(self.name) {
                Some(existing) if existing.address() != self.address() => {
                    log::warn!(
                        "registry: '{}' already names 0x{:x}; ignoring 0x{:x}",
                        self.name,
                        existing.address() as usize,
                        self.address() as usize
                    );
                }
                Some(_) => {}
                None => {
                    log::debug!("registry: '{}' ({}) at 0x{:x}", self.name, self.signature, self.address() as usize);
                    t.names.insert(self.name, self);
                }
            }
        });
    }

    /// The live hook on this function, if any.
    pub fn active(&self) -> Option<Arc<Hook>> {
        table().active.get(&(self.address() as usize)).cloned()
    }

    /// Redirect this function to `replacement` until the returned guard drops.
    ///
    /// If the function is already hooked, the new replacement shadows the
    /// current one for the guard's lifetime.
    ///
    /// # Safety
    /// `replacement` must have this function's ABI and signature.
    pub unsafe fn install(&'static self, replacement: *const c_void) -> Result<ScopedInstall> {
        self.register();
        let target = self.address();
        let mut t = table();
        if let Some(hook) = t.active.get(&(target as usize)) {
            let previous = hook.replacement();
            hook.retarget(replacement)?;
            log::debug!("registry: '{}' shadowed 0x{:x} -> 0x{:x}", self.name, previous as usize, replacement as usize);
            return Ok(ScopedInstall::shadowing(hook.clone(), previous, self));
        }
        let hook = Hook::new(target, replacement)?;
        let guard = ScopedInstall::new(hook.clone())?.owned_by(self);
        // Published only once the patch is in place.
        t.active.insert(target as usize, hook);
        Ok(guard)
    }

    /// Swap the replacement of the live hook.
    ///
    /// # Safety
    /// `replacement` must have this function's ABI and signature.
    pub unsafe fn replace(&self, replacement: *const c_void) -> Result<()> {
        self.active().ok_or(HookError::NotInstalled)?.replace(replacement)
    }

    /// Take the live hook out until the returned guard drops.
    pub fn remove_scope(&self) -> Result<ScopedRemove> {
        ScopedRemove::new(self.active().ok_or(HookError::NotInstalled)?)
    }

    /// Callable entry with the unhooked behavior.
    pub fn original(&self) -> *const c_void {
        match self.active() {
            Some(hook) => hook.original(),
            None => self.address(),
        }
    }

    pub(crate) fn release(&self, hook: &Arc<Hook>) {
        let mut t = table();
        let key = hook.target() as usize;
        if t.active.get(&key).is_some_and(|h| Arc::ptr_eq(h, hook)) {
            t.active.remove(&key);
        }
    }
}

/// Look up a registered function by name.
pub fn lookup(name: &str) -> Result<&'static Registration> {
    table()
        .names
        .get(name)
        .copied()
        .ok_or_else(|| HookError::UnknownTarget(name.to_string()))
}

/// Names of every registered function, sorted.
pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<_> = table().names.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Hook the function registered as `name`.
///
/// # Safety
/// See [`Registration::install`].
pub unsafe fn install(name: &str, replacement: *const c_void) -> Result<ScopedInstall> {
    lookup(name)?.install(replacement)
}

/// # Safety
/// See [`Registration::replace`].
pub unsafe fn replace(name: &str, replacement: *const c_void) -> Result<()> {
    lookup(name)?.replace(replacement)
}

pub fn remove_scope(name: &str) -> Result<ScopedRemove> {
    lookup(name)?.remove_scope()
}

/// Reinstall a hook taken out by [`remove_scope`], reporting the outcome.
pub fn reinstall_scope(scope: ScopedRemove) -> Result<()> {
    scope.reinstall()
}

/// A typed hookable declaration. See [`declare_hookable!`](crate::declare_hookable).
pub struct Hookable<F: Signature> {
    registration: Registration,
    _fn: PhantomData<F>,
}

impl<F: Signature> core::fmt::Debug for Hookable<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.registration.fmt(f)
    }
}

impl<F: Signature> Hookable<F> {
    pub const fn new(name: &'static str, signature: &'static str, resolve: fn() -> *const c_void) -> Self {
        Self {
            registration: Registration::new(name, signature, F::ARITY, resolve),
            _fn: PhantomData,
        }
    }

    pub fn register(&'static self) {
        self.registration.register();
    }

    pub fn registration(&'static self) -> &'static Registration {
        self.register();
        &self.registration
    }

    /// The declared function itself.
    pub fn target(&self) -> F {
        unsafe { F::from_addr(self.registration.address()) }
    }

    pub fn install(&'static self, replacement: F) -> Result<ScopedInstall> {
        unsafe { self.registration().install(replacement.addr()) }
    }

    pub fn replace(&'static self, replacement: F) -> Result<()> {
        unsafe { self.registration().replace(replacement.addr()) }
    }

    pub fn remove_scope(&'static self) -> Result<ScopedRemove> {
        self.registration().remove_scope()
    }

    /// Callable with the unhooked behavior, whether or not a hook is live.
    pub fn original(&self) -> F {
        unsafe { F::from_addr(self.registration.original()) }
    }
}

/// Declare a function as hookable.
///
/// ```ignore
/// declare_hookable!(pub FOPEN => libc::fopen as extern "C" fn(*const c_char, *const c_char) -> *mut FILE);
/// ```
#[macro_export]
macro_rules! declare_hookable {
    ($vis:vis $name:ident => $path:path as $ty:ty) => {
        $vis static $name: $crate::Hookable<$ty> = {
            fn resolve() -> *const ::core::ffi::c_void {
                $crate::Signature::addr($path as $ty)
            }
            $crate::Hookable::new(stringify!($path), stringify!($ty), resolve)
        };
    };
}

/// Install a replacement on a declared hookable for the returned guard's lifetime.
#[macro_export]
macro_rules! install_hook {
    ($hookable:path, $replacement:expr) => {
        $crate::Hookable::install(&$hookable, $replacement)
    };
}

/// Point a declared hookable's live hook at a new replacement without
/// restoring the original bytes in between.
#[macro_export]
macro_rules! replace_hook {
    ($hookable:path, $replacement:expr) => {
        $crate::Hookable::replace(&$hookable, $replacement)
    };
}

/// Take a declared hookable's live hook out for the returned guard's lifetime,
/// typically from inside the replacement before calling the real function.
#[macro_export]
macro_rules! scope_remove_hook {
    ($hookable:path) => {
        $crate::Hookable::remove_scope(&$hookable)
    };
}
