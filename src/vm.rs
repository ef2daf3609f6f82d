// Address-space management.
//
// spec.md §3 treats `pagetable`/`trapframe`/`kernel_stack` as opaque
// handles "managed by external collaborators" and §6 names the
// operations the scheduler core calls out to: set up, copy, grow,
// shrink, switch and tear down a process's address space. The always-on
// core (proc.rs) only ever calls the `pub fn` collaborator interface
// below; it never touches a `PageTable` directly. That split is what
// keeps proc.rs testable on host: under `cfg(any(test, feature =
// "kernel_as_a_lib"))` the interface is a handful of counters, and
// under the real build it drives the riscv Sv39 walker kept from the
// teacher's vm.rs.

use crate::riscv::{MAXVA, PGSIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X};
use crate::string::memset;
use crate::{PGROUNDDOWN, PGROUNDUP};

// ---- collaborator interface (spec.md §6) ----

/// Allocate one physical page for kernel use (a process's kernel stack
/// page). Returns an opaque handle, or `None` if memory is exhausted.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn alloc_kernel_page() -> Option<usize> {
    let p: *mut u8 = unsafe { crate::kalloc::KMEM.kalloc() };
    if p.is_null() {
        None
    } else {
        Some(p.expose_provenance())
    }
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn alloc_kernel_page() -> Option<usize> {
    Some(host_stub::next_handle())
}

/// Release a page returned by `alloc_kernel_page`.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn free_kernel_page(handle: usize) {
    unsafe { crate::kalloc::KMEM.kfree(handle as *mut u8) };
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn free_kernel_page(_handle: usize) {}

/// Allocate a trapframe page for a newly allocated process. Same
/// physical-page source as `alloc_kernel_page`, kept as a separate
/// name because the handle is interpreted differently (`trap.rs`'s
/// `TrapFrame` register layout rather than a bare kernel stack).
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn alloc_trapframe() -> Option<usize> {
    let p: *mut u8 = unsafe { crate::kalloc::KMEM.kalloc() };
    if p.is_null() {
        None
    } else {
        Some(p.expose_provenance())
    }
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn alloc_trapframe() -> Option<usize> {
    Some(host_stub::next_handle())
}

/// Release a trapframe returned by `alloc_trapframe`.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn free_trapframe(handle: usize) {
    unsafe { crate::kalloc::KMEM.kfree(handle as *mut u8) };
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn free_trapframe(_handle: usize) {}

/// Duplicate a trapframe's raw contents into a freshly allocated one,
/// for `fork` (spec.md §4.7: "duplicates the caller's ... trap frame").
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn copy_trapframe(src: usize, dst: usize) {
    unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PGSIZE) };
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn copy_trapframe(_src: usize, _dst: usize) {}

/// Zero a trapframe's syscall return-value register, so a fork child
/// sees `0` from its pending `fork()` call (spec.md §4.7).
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn trapframe_clear_return(handle: usize) {
    unsafe { (*(handle as *mut crate::trap::TrapFrame)).a0 = 0 };
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn trapframe_clear_return(_handle: usize) {}

/// Point a freshly allocated trapframe at user address 0 with the
/// given stack pointer, for a process's first-ever return to user
/// mode (`userinit`).
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn init_user_trapframe(handle: usize, user_sp: usize) {
    let tf = unsafe { &mut *(handle as *mut crate::trap::TrapFrame) };
    tf.epc = 0;
    tf.sp = user_sp as u64;
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn init_user_trapframe(_handle: usize, _user_sp: usize) {}

/// Build a fresh address space for a newly allocated process: an empty
/// top-level page table with nothing mapped yet. Mirrors xv6's
/// `proc_pagetable` minus the trapframe/trampoline mappings, which
/// belong to the (out-of-scope) trap subsystem.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn setup_address_space() -> Option<usize> {
    uvmcreate().map(|pt| (pt as *mut PageTable).expose_provenance())
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn setup_address_space() -> Option<usize> {
    Some(host_stub::next_handle())
}

/// Copy a parent's address space into a freshly created child one, for
/// `fork`. Returns `None` if memory is exhausted partway through, in
/// which case the caller must tear down whatever the child had.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn copy_address_space(parent: usize, child: usize, sz: usize) -> Option<()> {
    let parent_pt = unsafe { (parent as *mut PageTable).as_mut()? };
    let child_pt = unsafe { (child as *mut PageTable).as_mut()? };
    if uvmcopy(parent_pt, child_pt, sz) == 0 {
        Some(())
    } else {
        None
    }
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn copy_address_space(_parent: usize, _child: usize, _sz: usize) -> Option<()> {
    Some(())
}

/// Grow or shrink a process's heap by `delta` bytes (may be negative),
/// returning the new size, or `None` on allocation failure.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn grow_address_space(pagetable: usize, old_sz: usize, delta: usize) -> Option<usize> {
    let pt = unsafe { (pagetable as *mut PageTable).as_mut()? };
    uvmalloc(pt, old_sz, old_sz + delta)
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn grow_address_space(_pagetable: usize, old_sz: usize, delta: usize) -> Option<usize> {
    Some(old_sz + delta)
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn shrink_address_space(pagetable: usize, old_sz: usize, delta: usize) -> usize {
    let pt = unsafe { (pagetable as *mut PageTable).as_mut().unwrap() };
    uvmdealloc(pt, old_sz, old_sz - delta)
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn shrink_address_space(_pagetable: usize, old_sz: usize, delta: usize) -> usize {
    old_sz - delta
}

/// Install `pagetable` as the hart's active address space. Called from
/// `sched()` immediately before the context switch into a RUNNABLE
/// process.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn switch_address_space(pagetable: usize) {
    use crate::riscv::sfence_vma;
    sfence_vma();
    crate::riscv::w_satp(crate::MAKE_SATP!(pagetable));
    sfence_vma();
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn switch_address_space(_pagetable: usize) {}

/// Tear down an address space and every page it maps, for `exit`.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn free_address_space(pagetable: usize, sz: usize) {
    let pt = unsafe { (pagetable as *mut PageTable).as_mut().unwrap() };
    uvmfree(pt, sz);
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn free_address_space(_pagetable: usize, _sz: usize) {}

/// Load the first process's initcode image at address 0 of a freshly
/// created address space (xv6's `uvmfirst`), for `userinit`.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn load_initcode(pagetable: usize, code: &[u8]) {
    let pt = unsafe { (pagetable as *mut PageTable).as_mut().unwrap() };
    uvmfirst(pt, code);
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn load_initcode(_pagetable: usize, _code: &[u8]) {}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
mod host_stub {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(1);

    /// Host stand-in address-space "handles" just need to be distinct
    /// from each other; nothing ever dereferences them off-target.
    pub fn next_handle() -> usize {
        NEXT.fetch_add(1, Ordering::SeqCst)
    }
}

// ---- riscv Sv39 walker, real build only ----
//
// Kept close to the teacher's vm.rs. Trimmed of the fixed kernel-page
// mappings (UART/PLIC/trampoline/etext) that belonged to the dropped
// boot-time kvmmake(): this crate's scope is the process table and
// scheduler, not a full virtual memory subsystem, so only the
// user-address-space primitives the collaborator interface above needs
// are kept.

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub use real::*;

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod real {
    use super::*;
    use crate::kalloc::KMEM;

    #[derive(Clone, Copy)]
    pub struct Pte(pub usize);

    #[repr(align(4096))]
    pub struct PageTable(pub [Pte; 512]);

    macro_rules! PX {
        ($level:expr, $va:expr) => {
            (($va) >> (PGSHIFT + 9 * ($level))) & PXMASK
        };
    }
    macro_rules! PA2PTE {
        ($pa:expr) => {
            (($pa as usize) >> 12) << 10
        };
    }
    macro_rules! PTE2PA {
        ($pte:expr) => {
            (($pte) >> 10) << 12
        };
    }
    macro_rules! PTE_FLAGS {
        ($pte:expr) => {
            ($pte) & 0x3FF
        };
    }

    use crate::riscv::{PGSHIFT, PXMASK};

    pub fn uvmcreate<'a>() -> Option<&'a mut PageTable> {
        unsafe {
            let pagetable: *mut PageTable = KMEM.kalloc();
            if pagetable.is_null() {
                return None;
            }
            memset(pagetable as *mut u8, 0, PGSIZE);
            pagetable.as_mut()
        }
    }

    fn walk(pagetable: &mut PageTable, va: usize, alloc: bool) -> Option<&mut Pte> {
        if va >= MAXVA {
            panic!("walk");
        }

        let mut curr = pagetable;
        for level in (1..3).rev() {
            let pte = &mut curr.0[PX!(level, va)];
            if pte.0 & PTE_V == PTE_V {
                curr = unsafe { &mut *(PTE2PA!(pte.0) as *mut PageTable) };
            } else {
                if !alloc {
                    return None;
                }
                let next: *mut PageTable = unsafe { KMEM.kalloc() };
                if next.is_null() {
                    return None;
                }
                memset(next as *mut u8, 0, PGSIZE);
                *pte = Pte(PA2PTE!(next.expose_provenance()) | PTE_V);
                curr = unsafe { &mut *next };
            }
        }

        Some(&mut curr.0[PX!(0, va)])
    }

    pub fn mappages(pagetable: &mut PageTable, va: usize, mut pa: usize, size: usize, perm: usize) -> i32 {
        if size == 0 {
            panic!("mappages: size");
        }

        let mut a = PGROUNDDOWN!(va);
        let last = PGROUNDDOWN!(va + size - 1);

        loop {
            let pte = match walk(pagetable, a, true) {
                Some(pte) => pte,
                None => return -1,
            };
            if pte.0 & PTE_V != 0 {
                panic!("mappages: remap");
            }
            *pte = Pte(PA2PTE!(pa) | perm | PTE_V);
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        0
    }

    pub fn uvmunmap(pagetable: &mut PageTable, va: usize, npages: usize, do_free: bool) {
        if va % PGSIZE != 0 {
            panic!("uvmunmap: not aligned");
        }

        for a in (va..va + npages * PGSIZE).step_by(PGSIZE) {
            let pte = walk(pagetable, a, false).expect("uvmunmap: walk");
            if pte.0 & PTE_V == 0 {
                panic!("uvmunmap: not mapped");
            }
            if PTE_FLAGS!(pte.0) == PTE_V {
                panic!("uvmunmap: not a leaf");
            }
            if do_free {
                let pa = PTE2PA!(pte.0);
                unsafe { KMEM.kfree(pa as *mut PageTable) };
            }
            *pte = Pte(0);
        }
    }

    fn freewalk(pagetable: &mut PageTable) {
        for pte in &mut pagetable.0 {
            if pte.0 & PTE_V != 0 && pte.0 & (PTE_R | PTE_W | PTE_X) == 0 {
                let child = unsafe { &mut *(PTE2PA!(pte.0) as *mut PageTable) };
                freewalk(child);
                *pte = Pte(0);
            } else if pte.0 & PTE_V != 0 {
                panic!("freewalk: leaf");
            }
        }
        unsafe { KMEM.kfree(pagetable) };
    }

    pub fn uvmfree(pagetable: &mut PageTable, sz: usize) {
        if sz > 0 {
            uvmunmap(pagetable, 0, PGROUNDUP!(sz) / PGSIZE, true);
        }
        freewalk(pagetable);
    }

    /// Load the first process's initcode at address 0. `sz` must fit in
    /// a single page.
    pub fn uvmfirst(pagetable: &mut PageTable, src: &[u8]) {
        if src.len() >= PGSIZE {
            panic!("uvmfirst: more than a page");
        }
        let mem: *mut u8 = unsafe { KMEM.kalloc() };
        memset(mem, 0, PGSIZE);
        mappages(pagetable, 0, mem.expose_provenance(), PGSIZE, PTE_W | PTE_R | PTE_X | PTE_U);
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), mem, src.len()) };
    }

    /// Grow process memory from `old_sz` to `new_sz`, allocating and
    /// mapping pages one at a time. Returns the new size, or `None` and
    /// leaves the address space at its prior size if memory runs out.
    pub fn uvmalloc(pagetable: &mut PageTable, old_sz: usize, new_sz: usize) -> Option<usize> {
        if new_sz <= old_sz {
            return Some(old_sz);
        }

        let old_sz_up = PGROUNDUP!(old_sz);
        let mut a = old_sz_up;
        while a < new_sz {
            let mem: *mut u8 = unsafe { KMEM.kalloc() };
            if mem.is_null() {
                uvmdealloc(pagetable, a, old_sz);
                return None;
            }
            memset(mem, 0, PGSIZE);
            if mappages(pagetable, a, mem.expose_provenance(), PGSIZE, PTE_R | PTE_W | PTE_U) != 0 {
                unsafe { KMEM.kfree(mem) };
                uvmdealloc(pagetable, a, old_sz);
                return None;
            }
            a += PGSIZE;
        }
        Some(new_sz)
    }

    /// Shrink process memory from `old_sz` to `new_sz`. Returns the new
    /// size.
    pub fn uvmdealloc(pagetable: &mut PageTable, old_sz: usize, new_sz: usize) -> usize {
        if new_sz >= old_sz {
            return old_sz;
        }

        if PGROUNDUP!(new_sz) < PGROUNDUP!(old_sz) {
            let npages = (PGROUNDUP!(old_sz) - PGROUNDUP!(new_sz)) / PGSIZE;
            uvmunmap(pagetable, PGROUNDUP!(new_sz), npages, true);
        }
        new_sz
    }

    /// Copy a parent's page table and backing pages into a child's, for
    /// fork. Returns 0 on success, -1 on failure (and on failure,
    /// already-copied pages are unmapped before returning).
    pub fn uvmcopy(old: &mut PageTable, new: &mut PageTable, sz: usize) -> i32 {
        for i in (0..sz).step_by(PGSIZE) {
            let pte = walk(old, i, false).expect("uvmcopy: pte should exist");
            if pte.0 & PTE_V == 0 {
                panic!("uvmcopy: page not present");
            }
            let pa = PTE2PA!(pte.0);
            let flags = PTE_FLAGS!(pte.0);

            let mem: *mut u8 = unsafe { KMEM.kalloc() };
            if mem.is_null() {
                uvmunmap(new, 0, i / PGSIZE, true);
                return -1;
            }
            unsafe { core::ptr::copy_nonoverlapping(pa as *const u8, mem, PGSIZE) };

            if mappages(new, i, mem.expose_provenance(), flags) != 0 {
                unsafe { KMEM.kfree(mem) };
                uvmunmap(new, 0, i / PGSIZE, true);
                return -1;
            }
        }
        0
    }
}
