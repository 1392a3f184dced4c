//! cutie-hook: scoped runtime function interception for unit tests.
//!
//! Functions are redirected by rewriting their first instructions into a jump
//! to a relay. The relay forwards to a replacement, or to a typed mock thunk
//! that hands calls to a [`CallHandler`]. Every redirection is tied to a guard
//! and undone when the guard drops.

pub mod arch;
pub mod code;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod interceptor;
pub mod registry;
pub mod scoped;
pub mod signature;
pub mod types;

pub use config::HookConfig;
pub use dispatch::{CallHandler, CallLog, Invocation, MockScope, MockSlot, Mockable};
pub use interceptor::{Hook, Interceptor};
pub use registry::{Hookable, Registration};
pub use scoped::{ScopedInstall, ScopedRemove};
pub use signature::Signature;
pub use types::{HookError, Mode, Result};

/// Capture the environment configuration now instead of on the first hook.
pub fn init() {
    let config = HookConfig::global();
    log::debug!("cutie-hook: mode {:?}, {:?}", Mode::NATIVE, config);
}

/// Process-global lock for tests that patch code.
///
/// Tests that hook the same function concurrently would race on its bytes.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
