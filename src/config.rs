//! Runtime knobs for the patcher, read once from the environment.

use std::sync::OnceLock;

const DEFAULT_SLAB_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    /// Dump patch bytes and allocation decisions at `debug!` level (`CUTIE_HOOK_DEBUG`).
    pub debug: bool,
    /// Always emit the 16-byte absolute redirect on x86-64 (`CUTIE_HOOK_FORCE_ABSOLUTE`).
    pub force_absolute: bool,
    /// Size of each trampoline page (`CUTIE_HOOK_SLAB_SIZE`, minimum 4096).
    pub slab_size: usize,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            debug: false,
            force_absolute: false,
            slab_size: DEFAULT_SLAB_SIZE,
        }
    }
}

fn flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.trim(), "" | "0" | "false" | "no" | "off"),
        Err(_) => false,
    }
}

impl HookConfig {
    pub fn from_env() -> Self {
        let slab_size = std::env::var("CUTIE_HOOK_SLAB_SIZE")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_SLAB_SIZE)
            .max(DEFAULT_SLAB_SIZE);

        Self {
            debug: flag("CUTIE_HOOK_DEBUG"),
            force_absolute: flag("CUTIE_HOOK_FORCE_ABSOLUTE"),
            slab_size,
        }
    }

    /// Process-wide configuration, captured on first use.
    pub fn global() -> &'static HookConfig {
        static CONFIG: OnceLock<HookConfig> = OnceLock::new();
        CONFIG.get_or_init(HookConfig::from_env)
    }

    pub fn with_force_absolute(mut self, force: bool) -> Self {
        self.force_absolute = force;
        self
    }
}
