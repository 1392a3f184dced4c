use crate::config::HookConfig;
use crate::diagnostics;
use crate::types::{HookError, Result};
use core::ffi::c_void;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) mod patch;

use patch::PatchRecord;

/// Process-wide bookkeeping of which targets have a live [`Hook`].
///
/// At most one hook exists per target address; a second one is refused with
/// [`HookError::AlreadyInstalled`] until the first is dropped.
pub struct Interceptor {
    claimed: Mutex<HashSet<usize>>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: std::sync::OnceLock<Interceptor> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor {
            claimed: Mutex::new(HashSet::new()),
        })
    }

    fn claimed(&self) -> MutexGuard<'_, HashSet<usize>> {
        self.claimed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, target: usize) -> Result<()> {
        if self.claimed().insert(target) {
            Ok(())
        } else {
            Err(HookError::AlreadyInstalled)
        }
    }

    fn release(&self, target: usize) {
        self.claimed().remove(&target);
    }

    /// Whether a live hook exists for `target`.
    pub fn is_hooked(&self, target: *const c_void) -> bool {
        self.claimed().contains(&(target as usize))
    }
}

struct HookState {
    replacement: usize,
    record: Option<PatchRecord>,
}

/// Interception handle for one target function.
///
/// Created uninstalled. The relay page and trampoline are built on the first
/// [`install`](Hook::install) and reused until the handle is dropped.
pub struct Hook {
    target: usize,
    config: HookConfig,
    state: Mutex<HookState>,
}

impl core::fmt::Debug for Hook {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hook")
            .field("target", &format_args!("0x{:x}", self.target))
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl Hook {
    /// Create a handle redirecting `target` to `replacement`.
    ///
    /// # Safety
    /// `target` must be the entry point of a function in this process and
    /// `replacement` a function with the same ABI and signature. Both must
    /// outlive the installed hook.
    pub unsafe fn new(target: *const c_void, replacement: *const c_void) -> Result<Arc<Hook>> {
        Self::with_config(target, replacement, HookConfig::global().clone())
    }

    /// # Safety
    /// Same as [`Hook::new`].
    pub unsafe fn with_config(target: *const c_void, replacement: *const c_void, config: HookConfig) -> Result<Arc<Hook>> {
        let target = target as usize;
        if diagnostics::is_degraded(target) {
            return Err(HookError::Degraded(target));
        }
        Interceptor::obtain().claim(target)?;
        Ok(Arc::new(Hook {
            target,
            config,
            state: Mutex::new(HookState {
                replacement: replacement as usize,
                record: None,
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn target(&self) -> *const c_void {
        self.target as *const c_void
    }

    pub fn replacement(&self) -> *const c_void {
        self.state().replacement as *const c_void
    }

    pub fn is_installed(&self) -> bool {
        self.state().record.as_ref().is_some_and(|r| r.is_installed())
    }

    /// Redirect the target to the current replacement.
    pub fn install(&self) -> Result<()> {
        let mut st = self.state();
        let replacement = st.replacement;
        let record = match st.record.take() {
            Some(r) => r,
            None => unsafe { PatchRecord::prepare(self.target, &self.config)? },
        };
        unsafe { st.record.insert(record).install(replacement)? };
        log::debug!("hook: installed 0x{:x} -> 0x{:x}", self.target, replacement);
        Ok(())
    }

    /// Restore the target's original bytes.
    pub fn remove(&self) -> Result<()> {
        let mut st = self.state();
        match &mut st.record {
            Some(r) => unsafe { r.remove()? },
            None => return Err(HookError::NotInstalled),
        }
        log::debug!("hook: removed 0x{:x}", self.target);
        Ok(())
    }

    /// Switch an installed hook to `replacement` without restoring the
    /// original bytes in between.
    ///
    /// # Safety
    /// `replacement` must have the target's ABI and signature.
    pub unsafe fn replace(&self, replacement: *const c_void) -> Result<()> {
        let mut st = self.state();
        match &mut st.record {
            Some(r) => r.replace(replacement as usize)?,
            None => return Err(HookError::NotInstalled),
        }
        log::debug!("hook: 0x{:x} now -> 0x{:x}", self.target, replacement as usize);
        st.replacement = replacement as usize;
        Ok(())
    }

    /// Like [`replace`](Hook::replace) but also valid while removed, in which
    /// case the replacement takes effect on the next install.
    pub(crate) unsafe fn retarget(&self, replacement: *const c_void) -> Result<()> {
        let mut st = self.state();
        if let Some(r) = st.record.as_mut().filter(|r| r.is_installed()) {
            r.replace(replacement as usize)?;
        }
        st.replacement = replacement as usize;
        Ok(())
    }

    /// Callable entry with the unhooked behavior: the trampoline while
    /// installed, the target itself otherwise.
    pub fn original(&self) -> *const c_void {
        match &self.state().record {
            Some(r) => r.original_entry() as *const c_void,
            None => self.target(),
        }
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        let st = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut record) = st.record.take() {
            if record.is_installed() {
                if let Err(e) = unsafe { record.remove() } {
                    diagnostics::report(self.target, "drop", e);
                    // The target may still jump into the relay page; keep it mapped.
                    core::mem::forget(record);
                }
            }
        }
        Interceptor::obtain().release(self.target);
    }
}
