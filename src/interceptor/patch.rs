//! Code patching for one target.
//!
//! Page layout of a patch record:
//!
//! ```text
//! +0   relay:      jmp [slot]; ud2           (jumps to the current replacement)
//! +8   slot:       address word
//! +16  trampoline: [endbr64] relocated prologue; jmp target+consumed
//! ```
//!
//! The target's first `consumed` bytes are overwritten with a jump to the
//! relay, padded with NOPs. Retargeting the hook is a single aligned store to
//! the slot, so callers never fall through to the unhooked body while the
//! replacement changes.

use crate::arch::x86::relocator::{can_relocate, is_endbr64, Relocator};
use crate::arch::x86::writer::{X86Writer, FAR_JMP_SIZE, NEAR_JMP_SIZE};
use crate::code::allocator::{CodeAllocator, CodeSlice};
use crate::code::patcher::{patch_code, read_code, write_code};
use crate::config::HookConfig;
use crate::types::{HookError, Mode, Result};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Maximum relative distance for a near JMP rel32 (±2GB).
const NEAR_RANGE: usize = 0x7FFF_FFFF;

pub(crate) const RELAY_SLOT_OFFSET: usize = 8;
pub(crate) const TRAMPOLINE_OFFSET: usize = 16;

/// A redirect never consumes more than a 16-byte jump plus one 15-byte instruction.
const MAX_PATCH: usize = 32;

const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];

/// Emit the 16-byte relay that jumps through the slot at `+8`.
///
/// # Safety
/// `w` must have 16 bytes of room.
pub(crate) unsafe fn emit_relay(w: &mut X86Writer, initial: u64) {
    match w.mode() {
        Mode::Bits64 => w.put_jmp_far(initial),
        Mode::Bits32 => {
            let slot = w.pc() + RELAY_SLOT_OFFSET as u64;
            w.put_jmp_indirect_abs32(slot as u32);
            w.put_bytes(&[0x0F, 0x0B]);
            w.put_bytes(&(initial as u32).to_le_bytes());
            w.align_with_int3(TRAMPOLINE_OFFSET as u64);
        }
    }
}

/// Encode the jump written over the target: `jmp rel32` to the relay when it
/// reaches, the 16-byte absolute form otherwise, NOP-padded to `consumed`.
pub(crate) fn encode_redirect(mode: Mode, patch_pc: u64, relay: u64, near: bool, consumed: usize) -> [u8; MAX_PATCH] {
    let mut out = [0x90u8; MAX_PATCH];
    unsafe {
        let mut w = X86Writer::with_mode(out.as_mut_ptr(), out.len(), patch_pc, mode);
        if near {
            w.put_jmp_near(relay);
        } else {
            w.put_jmp_far(relay);
        }
        let written = w.offset();
        if written < consumed {
            w.put_nop_n(consumed - written);
        }
    }
    out
}

fn in_near_range(from: u64, to: u64) -> bool {
    let rel = (to as i64) - (from as i64 + NEAR_JMP_SIZE as i64);
    rel.unsigned_abs() as usize <= NEAR_RANGE
}

fn dump(config: &HookConfig, what: &str, addr: usize, bytes: &[u8]) {
    let level = if config.debug { log::Level::Debug } else { log::Level::Trace };
    log::log!(level, "patch: {} at 0x{:x}: {:02x?}", what, addr, bytes);
}

/// The patched state of one target: saved bytes, redirect bytes and the page
/// holding relay and trampoline.
#[derive(Debug)]
pub(crate) struct PatchRecord {
    target: usize,
    patch_addr: usize,
    consumed: usize,
    original: [u8; MAX_PATCH],
    redirect: [u8; MAX_PATCH],
    page: CodeSlice,
    installed: bool,
    config: HookConfig,
}

impl PatchRecord {
    /// Build the relay and trampoline for `target` without touching the
    /// target's code.
    ///
    /// Hosts other than x86 and x86-64 get `Unsupported` before any code is
    /// read.
    ///
    /// # Safety
    /// `target` must be the entry of a function in mapped, readable code.
    pub(crate) unsafe fn prepare(target: usize, config: &HookConfig) -> Result<Self> {
        if !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            return Err(HookError::Unsupported);
        }
        let mode = Mode::NATIVE;
        let has_endbr = mode == Mode::Bits64 && is_endbr64(target as *const u8);
        let patch_addr = if has_endbr { target + ENDBR64.len() } else { target };
        let patch_pc = patch_addr as u64;

        let mut alloc = CodeAllocator::new(config.slab_size);
        let page = match mode {
            Mode::Bits64 => alloc
                .alloc_near(patch_addr as *const u8, NEAR_RANGE)
                .or_else(|_| alloc.alloc_any())?,
            Mode::Bits32 => alloc.alloc_any()?,
        };
        let relay = page.pc as u64;
        let near = match mode {
            Mode::Bits32 => true,
            Mode::Bits64 => !config.force_absolute && in_near_range(patch_pc, relay),
        };
        let needed = if near { NEAR_JMP_SIZE } else { FAR_JMP_SIZE };

        let available = can_relocate(patch_addr as *const u8, needed, mode);
        if available < needed {
            return Err(HookError::PatchTooSmall { needed, available });
        }

        let trampoline = relay + TRAMPOLINE_OFFSET as u64;
        let mut w = X86Writer::with_mode(page.data, page.size, relay, mode);
        emit_relay(&mut w, trampoline);
        if has_endbr {
            w.put_bytes(&ENDBR64);
        }
        let mut r = Relocator::new(patch_addr as *const u8, patch_pc, mode);
        let consumed = r.relocate_bytes(&mut w, needed)?;
        if consumed > MAX_PATCH {
            return Err(HookError::RelocationFailed);
        }
        w.put_jmp_address(patch_pc + consumed as u64);
        alloc.make_executable(&page)?;

        let mut original = [0u8; MAX_PATCH];
        original[..consumed].copy_from_slice(&read_code(patch_addr as *const u8, consumed));
        let redirect = encode_redirect(mode, patch_pc, relay, near, consumed);

        log::debug!(
            "patch: prepared 0x{:x} (patch at 0x{:x}, {} bytes, {} redirect) relay=0x{:x}",
            target,
            patch_addr,
            consumed,
            if near { "near" } else { "absolute" },
            relay
        );

        Ok(Self {
            target,
            patch_addr,
            consumed,
            original,
            redirect,
            page,
            installed: false,
            config: config.clone(),
        })
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.installed
    }

    pub(crate) fn trampoline(&self) -> usize {
        self.page.pc as usize + TRAMPOLINE_OFFSET
    }

    /// Callable entry with the unhooked behavior.
    pub(crate) fn original_entry(&self) -> usize {
        if self.installed {
            self.trampoline()
        } else {
            self.target
        }
    }

    /// Point the relay at `value`. One aligned store, visible to every thread
    /// entering the relay afterwards.
    unsafe fn store_slot(&self, value: usize) -> Result<()> {
        let slot = self.page.data.add(RELAY_SLOT_OFFSET);
        patch_code(slot, core::mem::size_of::<usize>(), |p| {
            if p as usize % core::mem::align_of::<AtomicUsize>() == 0 {
                (*(p as *const AtomicUsize)).store(value, Ordering::Release);
            } else {
                (p as *mut usize).write_unaligned(value);
            }
        })
    }

    pub(crate) unsafe fn install(&mut self, replacement: usize) -> Result<()> {
        if self.installed {
            return Err(HookError::AlreadyInstalled);
        }
        self.store_slot(replacement)?;
        write_code(self.patch_addr as *mut u8, &self.redirect[..self.consumed])?;
        self.installed = true;
        dump(&self.config, "redirect", self.patch_addr, &self.redirect[..self.consumed]);
        Ok(())
    }

    pub(crate) unsafe fn remove(&mut self) -> Result<()> {
        if !self.installed {
            return Err(HookError::NotInstalled);
        }
        write_code(self.patch_addr as *mut u8, &self.original[..self.consumed])?;
        self.installed = false;
        // A thread still inside the relay now lands in the original body.
        self.store_slot(self.trampoline())?;
        dump(&self.config, "restored", self.patch_addr, &self.original[..self.consumed]);
        Ok(())
    }

    pub(crate) unsafe fn replace(&mut self, replacement: usize) -> Result<()> {
        if !self.installed {
            return Err(HookError::NotInstalled);
        }
        self.store_slot(replacement)
    }
}
