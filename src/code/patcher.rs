use crate::code::cache::invalidate_icache;
use crate::types::HookError;

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Page-aligned `[start, start+len)` covering `size` bytes at `addr`.
#[inline]
fn page_span(addr: *mut u8, size: usize) -> (usize, usize) {
    let page_sz = page_size();
    let start = (addr as usize) & !(page_sz - 1);
    let end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
    (start, end - start)
}

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::message::mach_msg_type_number_t;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_protect, mach_vm_write};
    use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, vm_offset_t};

    pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
        let (start, map_size) = page_span(addr, size);
        let task = mach_task_self();

        // VM_PROT_COPY lets signed __TEXT pages become writable as a private copy.
        let kr = mach_vm_protect(
            task,
            start as mach_vm_address_t,
            map_size as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
        );
        if kr == KERN_SUCCESS {
            apply(addr);
            let _ = mach_vm_protect(
                task,
                start as mach_vm_address_t,
                map_size as mach_vm_size_t,
                0,
                VM_PROT_READ | VM_PROT_EXECUTE,
            );
            invalidate_icache(addr, size);
            return Ok(());
        }
        log::debug!("patcher: mach_vm_protect kr={} at 0x{:x}; trying mach_vm_write", kr, start);

        // Kernel-assisted write of a prepared copy.
        let mut patched = vec![0u8; size];
        core::ptr::copy_nonoverlapping(addr as *const u8, patched.as_mut_ptr(), size);
        apply(patched.as_mut_ptr());
        let kr = mach_vm_write(
            task,
            addr as mach_vm_address_t,
            patched.as_ptr() as vm_offset_t,
            patched.len() as mach_msg_type_number_t,
        );
        if kr != KERN_SUCCESS {
            log::debug!("patcher: mach_vm_write kr={} at 0x{:x}", kr, addr as usize);
            return Err(HookError::ProtectFailed(addr as usize));
        }
        invalidate_icache(addr, size);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
        let (page_start, map_size) = page_span(addr, size);

        // Make writable (RWX so existing code on the page can still execute).
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            log::debug!(
                "patcher: mprotect RWX failed errno={} page=0x{:x}",
                std::io::Error::last_os_error(),
                page_start
            );
            return Err(HookError::ProtectFailed(addr as usize));
        }

        apply(addr);

        if libc::mprotect(page_start as *mut libc::c_void, map_size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            log::warn!("patcher: page 0x{:x} left RWX after patching", page_start);
        }

        // Flush the entire page: neighbouring functions may be patched independently.
        invalidate_icache(page_start as *mut u8, map_size);
        Ok(())
    }
}

/// Patch code at `addr` for `size` bytes.
///
/// `apply` receives a pointer through which the `size` bytes may be written.
/// On Linux the page is temporarily made RWX; on macOS a copy-on-write
/// protection change is tried before a kernel-assisted write.
///
/// # Safety
/// `addr` must point to `size` bytes of mapped code. `apply` must write within that range.
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }
    #[cfg(target_os = "macos")]
    {
        darwin::patch_code(addr, size, apply)
    }
    #[cfg(target_os = "linux")]
    {
        linux::patch_code(addr, size, apply)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (addr, apply);
        Err(HookError::Unsupported)
    }
}

/// Overwrite `bytes.len()` bytes at `addr` verbatim.
///
/// # Safety
/// Same as [`patch_code`].
pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) -> Result<(), HookError> {
    patch_code(addr, bytes.len(), |p| {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
    })
}

/// Snapshot `len` bytes of code at `addr`.
///
/// # Safety
/// `addr` must point to `len` readable bytes.
pub unsafe fn read_code(addr: *const u8, len: usize) -> Vec<u8> {
    core::slice::from_raw_parts(addr, len).to_vec()
}
