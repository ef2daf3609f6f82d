// Physical page allocator. Kept close to the teacher's kalloc.rs: a
// free list of pages threaded through the pages themselves, guarded by
// its own Spinlock (distinct from the table_lock — allocation is not a
// process-table operation).

use core::ptr;

use crate::memlayout::PHYSTOP;
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;
use crate::string::memset;
use crate::PGROUNDUP;

extern "C" {
    // first address after the kernel image, set by the linker script.
    static mut end: u8;
}

struct Run {
    next: *mut Run,
}

pub struct KMem {
    lock: Spinlock,
    freelist: *mut Run,
}

pub static mut KMEM: KMem = KMem::create();

impl KMem {
    const fn create() -> Self {
        Self {
            lock: Spinlock::init_lock("kmem"),
            freelist: ptr::null_mut(),
        }
    }

    pub fn kinit() {
        unsafe {
            KMEM.freerange((&mut end) as *mut u8, PHYSTOP as *mut u8);
        }
    }

    fn freerange<T: Sized>(&mut self, pa_start: *mut T, pa_end: *mut T) {
        let mut p = PGROUNDUP!(pa_start);
        while p + PGSIZE <= pa_end as usize {
            self.kfree(p as *mut T);
            p += PGSIZE;
        }
    }

    /// Free the page of physical memory pointed at by `pa`, which must
    /// have come from `kalloc` (the exception is `kinit`'s initial
    /// sweep over free RAM).
    pub fn kfree<T: Sized>(&mut self, pa: *mut T) {
        let pa_usize = pa as usize;
        unsafe {
            if pa_usize % PGSIZE != 0 || pa_usize < (&end as *const u8) as usize || pa_usize >= PHYSTOP {
                panic!("kfree");
            }
        }

        // Fill with junk to catch dangling refs.
        memset(pa as *mut u8, 1, PGSIZE);

        let r = pa as *mut Run;

        self.lock.acquire();
        unsafe {
            (*r).next = self.freelist;
        }
        self.freelist = r;
        self.lock.release();
    }

    /// Allocate one 4096-byte page of physical memory, or a null
    /// pointer if none remain.
    pub fn kalloc<T: Sized>(&mut self) -> *mut T {
        self.lock.acquire();
        let r = self.freelist;
        if !r.is_null() {
            unsafe {
                self.freelist = (*r).next;
            }
        }
        self.lock.release();

        if !r.is_null() {
            memset(r as *mut u8, 5, PGSIZE); // fill with junk
        }
        r as *mut T
    }
}
