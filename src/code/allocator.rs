use crate::types::HookError;

const MIN_SLAB: usize = 4096;

/// An anonymous code page owned by one trampoline. Unmapped on drop.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl CodeSlice {
    fn mapped(base: usize, size: usize) -> Self {
        Self {
            data: base as *mut u8,
            pc: base as *const u8,
            size,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.data as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for CodeSlice {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe { os::unmap(self.data as usize, self.size) };
        }
    }
}

/// Page-granular allocator for relay pages.
#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: MIN_SLAB }
    }
}

/// Page-aligned start addresses of free holes in `mapped` that can hold
/// `need` bytes within `max_distance` of `near`, nearest first.
///
/// `mapped` is a list of `[start, end)` ranges in any order.
fn gap_candidates(
    mut mapped: Vec<(usize, usize)>,
    near: usize,
    max_distance: usize,
    need: usize,
    page: usize,
) -> Vec<usize> {
    let mask = !(page - 1);
    let lo = (near.saturating_sub(max_distance) & mask).max(page);
    let hi = near.saturating_add(max_distance) & mask;
    mapped.sort_unstable_by_key(|&(start, _)| start);
    mapped.push((hi, hi));

    let mut out = Vec::new();
    let mut cursor = lo;
    for (start, end) in mapped {
        let hole_end = start.min(hi);
        if hole_end > cursor && hole_end - cursor >= need {
            let pick = near.clamp(cursor, hole_end - need) & mask;
            if pick >= cursor {
                out.push(pick);
            }
        }
        if start >= hi {
            break;
        }
        cursor = cursor.max(end);
    }
    out.sort_unstable_by_key(|&c| c.abs_diff(near));
    out
}

impl CodeAllocator {
    /// Allocator handing out `slab_size` byte pages (at least one 4KiB page).
    pub fn new(slab_size: usize) -> Self {
        Self {
            slab_size: slab_size.max(MIN_SLAB),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Allocate a RW slab whose start lies within `max_distance` bytes of `near`.
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice, HookError> {
        let page = os::page_size();
        let need = self.slab_size;
        let mapped = unsafe { os::mapped_regions()? };
        for candidate in gap_candidates(mapped, near as usize, max_distance, need, page) {
            if let Some(base) = unsafe { os::map_fixed(candidate, need) } {
                log::trace!("alloc: near 0x{:x} -> 0x{:x}", near as usize, base);
                return Ok(CodeSlice::mapped(base, need));
            }
        }
        Err(HookError::AllocationFailed)
    }

    /// Allocate a RW slab wherever the kernel places it.
    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        let base = unsafe { os::map_anywhere(self.slab_size) }.ok_or(HookError::AllocationFailed)?;
        Ok(CodeSlice::mapped(base, self.slab_size))
    }

    /// Flip a slab from RW (emission) to RX (execution).
    ///
    /// # Safety
    /// No thread may be writing into `slice` concurrently.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        if !os::protect_rx(slice.data as usize, slice.size) {
            return Err(HookError::ProtectFailed(slice.data as usize));
        }
        crate::code::cache::invalidate_icache(slice.data, slice.size);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod os {
    use crate::types::HookError;

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub unsafe fn mapped_regions() -> Result<Vec<(usize, usize)>, HookError> {
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(|_| HookError::AllocationFailed)?;
        Ok(maps
            .lines()
            .filter_map(|line| {
                let (start, end) = line.split_whitespace().next()?.split_once('-')?;
                Some((usize::from_str_radix(start, 16).ok()?, usize::from_str_radix(end, 16).ok()?))
            })
            .collect())
    }

    unsafe fn map(hint: usize, size: usize, extra: libc::c_int) -> Option<usize> {
        let ptr = libc::mmap(
            hint as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
            -1,
            0,
        );
        (ptr != libc::MAP_FAILED).then_some(ptr as usize)
    }

    pub unsafe fn map_fixed(at: usize, size: usize) -> Option<usize> {
        let base = map(at, size, libc::MAP_FIXED_NOREPLACE)?;
        // Kernels before 4.17 treat the hint as advisory.
        if base != at {
            libc::munmap(base as *mut libc::c_void, size);
            return None;
        }
        Some(base)
    }

    pub unsafe fn map_anywhere(size: usize) -> Option<usize> {
        map(0, size, 0)
    }

    pub unsafe fn protect_rx(base: usize, size: usize) -> bool {
        libc::mprotect(base as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC) == 0
    }

    pub unsafe fn unmap(base: usize, size: usize) {
        libc::munmap(base as *mut libc::c_void, size);
    }
}

#[cfg(target_os = "macos")]
mod os {
    use crate::types::HookError;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_region};
    use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
    use mach2::vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED};

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub unsafe fn mapped_regions() -> Result<Vec<(usize, usize)>, HookError> {
        let task = mach_task_self();
        let mut regions = Vec::new();
        let mut addr: u64 = 0;
        loop {
            let mut size: u64 = 0;
            let mut info: vm_region_basic_info_64 = core::mem::zeroed();
            let mut count = vm_region_basic_info_64::count();
            let mut object: u32 = 0;
            let kr = mach_vm_region(
                task,
                &mut addr,
                &mut size,
                VM_REGION_BASIC_INFO_64,
                (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
                &mut count,
                &mut object,
            );
            if kr != KERN_SUCCESS {
                break;
            }
            regions.push((addr as usize, addr.saturating_add(size) as usize));
            addr = addr.saturating_add(size);
        }
        Ok(regions)
    }

    unsafe fn allocate(at: usize, size: usize, flags: i32) -> Option<usize> {
        let task = mach_task_self();
        let mut addr = at as u64;
        if mach_vm_allocate(task, &mut addr, size as u64, flags) != KERN_SUCCESS {
            return None;
        }
        if mach_vm_protect(task, addr, size as u64, 0, VM_PROT_READ | VM_PROT_WRITE) != KERN_SUCCESS {
            mach_vm_deallocate(task, addr, size as u64);
            return None;
        }
        Some(addr as usize)
    }

    pub unsafe fn map_fixed(at: usize, size: usize) -> Option<usize> {
        allocate(at, size, VM_FLAGS_FIXED)
    }

    pub unsafe fn map_anywhere(size: usize) -> Option<usize> {
        allocate(0, size, VM_FLAGS_ANYWHERE)
    }

    pub unsafe fn protect_rx(base: usize, size: usize) -> bool {
        mach_vm_protect(mach_task_self(), base as u64, size as u64, 0, VM_PROT_READ | VM_PROT_EXECUTE) == KERN_SUCCESS
    }

    pub unsafe fn unmap(base: usize, size: usize) {
        mach_vm_deallocate(mach_task_self(), base as u64, size as u64);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod os {
    use crate::types::HookError;

    pub fn page_size() -> usize {
        4096
    }

    pub unsafe fn mapped_regions() -> Result<Vec<(usize, usize)>, HookError> {
        Err(HookError::Unsupported)
    }

    pub unsafe fn map_fixed(_at: usize, _size: usize) -> Option<usize> {
        None
    }

    pub unsafe fn map_anywhere(_size: usize) -> Option<usize> {
        None
    }

    pub unsafe fn protect_rx(_base: usize, _size: usize) -> bool {
        false
    }

    pub unsafe fn unmap(_base: usize, _size: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x1000;

    #[test]
    fn gap_candidates_prefers_hole_closest_to_target() {
        let mapped = vec![(0x40_0000, 0x50_0000), (0x10_0000, 0x20_0000), (0x51_0000, 0x60_0000)];
        let got = gap_candidates(mapped, 0x48_0000, 0x30_0000, PAGE, PAGE);
        assert_eq!(got.first(), Some(&0x50_0000));
        assert!(got.contains(&(0x40_0000 - PAGE)));
        assert!(got.contains(&0x60_0000));
    }

    #[test]
    fn gap_candidates_skips_holes_that_are_too_small() {
        let mapped = vec![(0x10_0000, 0x20_0000), (0x20_1000, 0x30_0000)];
        let got = gap_candidates(mapped, 0x20_0800, 0x8000, 2 * PAGE, PAGE);
        assert!(got.is_empty(), "{got:x?}");
    }

    #[test]
    fn gap_candidates_never_returns_page_zero() {
        let got = gap_candidates(Vec::new(), 0x800, 0x10_0000, PAGE, PAGE);
        assert!(got.iter().all(|&c| c >= PAGE));
        assert_eq!(got, vec![PAGE]);
    }

    #[test]
    fn alloc_any_returns_executable_page() {
        let mut alloc = CodeAllocator::default();
        let slice = alloc.alloc_any().expect("alloc");
        unsafe {
            slice.data.write(0xC3); // ret
            alloc.make_executable(&slice).expect("protect");
        }
        assert!(slice.contains(slice.data as usize));
        assert!(!slice.contains(slice.data as usize + slice.size));
    }

    #[test]
    fn alloc_near_returns_within_range() {
        let mut alloc = CodeAllocator::default();
        let near = alloc_near_returns_within_range as *const u8;
        let max_distance = 1024 * 1024 * 1024;
        let slice = alloc.alloc_near(near, max_distance).expect("alloc_near");
        assert!((slice.data as usize).abs_diff(near as usize) <= max_distance);
    }

    #[test]
    fn slab_size_has_page_floor() {
        assert_eq!(CodeAllocator::new(16).slab_size(), 4096);
        assert_eq!(CodeAllocator::new(8192).slab_size(), 8192);
    }
}
