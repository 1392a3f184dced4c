use thiserror::Error;

/// Instruction width the patcher encodes and decodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// 32-bit x86: flat 4GiB address space, every target is `jmp rel32` reachable.
    Bits32,
    /// x86-64: `rel32` reaches ±2GiB, beyond that an absolute jump is required.
    Bits64,
}

impl Mode {
    #[cfg(target_arch = "x86")]
    pub const NATIVE: Mode = Mode::Bits32;

    #[cfg(not(target_arch = "x86"))]
    pub const NATIVE: Mode = Mode::Bits64;

    #[inline]
    pub fn pointer_size(self) -> usize {
        match self {
            Mode::Bits32 => 4,
            Mode::Bits64 => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("function prologue too small to patch: need {needed} bytes, found {available}")]
    PatchTooSmall { needed: usize, available: usize },

    #[error("interception already installed")]
    AlreadyInstalled,

    #[error("interception not installed")]
    NotInstalled,

    #[error("hook removed twice without an intervening reinstall")]
    DoubleRemove,

    #[error("hook reinstalled while already installed")]
    DoubleReinstall,

    #[error("failed to allocate executable memory")]
    AllocationFailed,

    #[error("failed to change page protection at 0x{0:x}")]
    ProtectFailed(usize),

    #[error("prologue instruction cannot be relocated")]
    RelocationFailed,

    #[error("no hookable function registered as '{0}'")]
    UnknownTarget(String),

    #[error("target 0x{0:x} is degraded after a failed unpatch; refusing to hook it")]
    Degraded(usize),

    #[error("function interception is not supported on this platform")]
    Unsupported,
}

pub type Result<T> = std::result::Result<T, HookError>;
