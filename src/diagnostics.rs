//! Process-wide sink for failures that happen where no caller can receive them.
//!
//! Guard destructors cannot return errors. When unpatching fails during a
//! `Drop`, the failure is logged, recorded here, and the target is marked as
//! degraded: its code bytes are in an unknown state, so further hooks on it are
//! refused with [`HookError::Degraded`].

use crate::types::HookError;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub target: usize,
    pub operation: &'static str,
    pub error: HookError,
}

#[derive(Default)]
struct Sink {
    entries: Vec<Diagnostic>,
    degraded: HashSet<usize>,
}

fn sink() -> MutexGuard<'static, Sink> {
    static SINK: OnceLock<Mutex<Sink>> = OnceLock::new();
    SINK.get_or_init(|| Mutex::new(Sink::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Record a drop-path failure. Errors that leave the code bytes untouched
/// (`DoubleReinstall`, `NotInstalled`) are recorded without degrading the target.
pub fn report(target: usize, operation: &'static str, error: HookError) {
    log::error!("cutie-hook: {} failed for 0x{:x}: {}", operation, target, error);
    let degrades = !matches!(
        error,
        HookError::DoubleReinstall | HookError::DoubleRemove | HookError::NotInstalled | HookError::AlreadyInstalled
    );
    let mut s = sink();
    if degrades {
        s.degraded.insert(target);
    }
    s.entries.push(Diagnostic { target, operation, error });
}

pub fn is_degraded(target: usize) -> bool {
    sink().degraded.contains(&target)
}

/// Drain all recorded diagnostics.
pub fn take() -> Vec<Diagnostic> {
    core::mem::take(&mut sink().entries)
}

/// Drain the diagnostics recorded for one target, leaving the rest.
pub fn take_for(target: usize) -> Vec<Diagnostic> {
    let mut s = sink();
    let (mine, rest) = core::mem::take(&mut s.entries)
        .into_iter()
        .partition(|d| d.target == target);
    s.entries = rest;
    mine
}
