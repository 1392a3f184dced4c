#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
}

/// Make freshly written instructions visible to instruction fetch.
///
/// x86 keeps the instruction cache coherent with stores, so the only thing
/// needed there is a full fence: the patch must be globally visible before the
/// writer publishes the hook to other threads. Other targets get an explicit
/// invalidation.
///
/// # Safety
/// `addr` must point to at least `size` bytes of mapped memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

    #[cfg(target_os = "macos")]
    {
        sys_icache_invalidate(addr as *mut core::ffi::c_void, size);
    }

    #[cfg(all(target_os = "linux", not(any(target_arch = "x86", target_arch = "x86_64"))))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
    {
        let _ = (addr, size);
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (addr, size);
    }
}

