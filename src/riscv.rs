// RISC-V register and intrinsic access.
//
// A handful of primitives here (`r_tp`, `intr_get/on/off`, the sync
// intrinsics) are reachable from the always-compiled scheduler core
// (`spinlock.rs`, `proc.rs`) because the concurrency discipline is
// built directly on top of them. They get a second, host-safe body
// under `cfg(any(test, feature = "kernel_as_a_lib"))` so the core can
// be exercised as an ordinary hosted Rust library. Everything else
// here (CSR access for paging, traps, timers) is only ever reached
// from the real boot/trap/vm code, which is itself kernel-only, so it
// keeps a single riscv-only body.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use core::arch::asm;

pub const PGSIZE: usize = 4096; // bytes per page
pub const PGSHIFT: usize = 12; // bits of offset within a page

pub const PTE_V: usize = 1 << 0; // valid
pub const PTE_R: usize = 1 << 1;
pub const PTE_W: usize = 1 << 2;
pub const PTE_X: usize = 1 << 3;
pub const PTE_U: usize = 1 << 4; // user can access

pub const PXMASK: usize = 0x1FF; // 9 bits
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

// ---- primitives reachable from the always-on core ----

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn r_tp() -> u64 {
    let mut x: u64;
    unsafe { asm!("mv {}, tp", out(reg) x) }
    x
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn r_tp() -> u64 {
    // A host test process has exactly one "hart".
    0
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
static HOST_INTR_ENABLED: AtomicBool = AtomicBool::new(true);

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn intr_get() -> bool {
    HOST_INTR_ENABLED.load(Ordering::SeqCst)
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn intr_on() {
    HOST_INTR_ENABLED.store(true, Ordering::SeqCst);
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn intr_off() {
    HOST_INTR_ENABLED.store(false, Ordering::SeqCst);
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn __sync_lock_test_and_set(ptr: *mut u64, val: u64) -> u64 {
    let mut out: u64;
    unsafe {
        asm!("amoswap.w.aq {0}, {1}, ({2})", out(reg) out, in(reg) val, in(reg) ptr);
    }
    out
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn __sync_lock_test_and_set(ptr: *mut u64, val: u64) -> u64 {
    // The pointee is only ever reached through `Spinlock`, which never
    // hands out more than one `&mut` at a time, so a plain atomic swap
    // on the host is an exact stand-in for the riscv amoswap.
    let atomic = unsafe { &*(ptr as *const AtomicU64) };
    atomic.swap(val, Ordering::SeqCst)
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn __sync_lock_release(ptr: *const u64) {
    unsafe {
        asm!("amoswap.w.rl zero, zero, ({0})", in(reg) ptr);
    }
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn __sync_lock_release(ptr: *const u64) {
    let atomic = unsafe { &*(ptr as *const AtomicU64) };
    atomic.store(0, Ordering::SeqCst);
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn __sync_synchronize() {
    unsafe {
        asm!("fence rw, rw");
    }
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn __sync_synchronize() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

// ---- everything below here is only reachable from kernel-only code ----

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod hart {
    use super::*;

    pub fn r_mhartid() -> u64 {
        let mut x: u64 = 0;
        unsafe { asm!("csrr {}, mhartid", out(reg) x) }
        x
    }

    pub const MSTATUS_MPP_MASK: u64 = 3 << 11;
    pub const MSTATUS_MPP_S: u64 = 1 << 11;
    pub const MSTATUS_MIE: u64 = 1 << 3;

    pub fn r_mstatus() -> u64 {
        let mut x: u64 = 0;
        unsafe { asm!("csrr {}, mstatus", out(reg) x) }
        x
    }

    pub fn w_mstatus(x: u64) {
        unsafe { asm!("csrw mstatus, {}", in(reg) x) }
    }

    pub fn w_mepc(x: usize) {
        unsafe { asm!("csrw mepc, {}", in(reg) x) }
    }

    pub const SSTATUS_SPP: u64 = 1 << 8;
    pub const SSTATUS_SPIE: u64 = 1 << 5;
    pub const SSTATUS_SIE: u64 = 1 << 1;

    pub fn r_sstatus() -> u64 {
        let mut x: u64 = 0;
        unsafe { asm!("csrr {}, sstatus", out(reg) x) }
        x
    }

    pub fn w_sstatus(x: u64) {
        unsafe { asm!("csrw sstatus, {}", in(reg) x) }
    }

    pub const SIE_SEIE: u64 = 1 << 9;
    pub const SIE_STIE: u64 = 1 << 5;
    pub const SIE_SSIE: u64 = 1 << 1;

    pub fn r_sie() -> u64 {
        let mut x: u64 = 0;
        unsafe { asm!("csrr {}, sie", out(reg) x) }
        x
    }

    pub fn w_sie(x: u64) {
        unsafe { asm!("csrw sie, {}", in(reg) x) }
    }

    pub fn w_sepc(x: usize) {
        unsafe { asm!("csrw sepc, {}", in(reg) x) }
    }

    pub fn r_sepc() -> usize {
        let mut x: usize = 0;
        unsafe { asm!("csrr {}, sepc", out(reg) x) }
        x
    }

    pub fn w_medeleg(x: u64) {
        unsafe { asm!("csrw medeleg, {}", in(reg) x) }
    }

    pub fn w_mideleg(x: u64) {
        unsafe { asm!("csrw mideleg, {}", in(reg) x) }
    }

    pub fn r_stvec() -> usize {
        let mut x: usize = 0;
        unsafe { asm!("csrr {}, stvec", out(reg) x) }
        x
    }

    pub fn w_stvec(x: usize) {
        unsafe { asm!("csrw stvec, {}", in(reg) x) }
    }

    pub fn w_pmpcfg0(x: u64) {
        unsafe { asm!("csrw pmpcfg0, {}", in(reg) x) }
    }

    pub fn w_pmpaddr0(x: u64) {
        unsafe { asm!("csrw pmpaddr0, {}", in(reg) x) }
    }

    pub const SATP_SV39: usize = 8 << 60;

    pub fn r_satp() -> usize {
        let mut x: usize = 0;
        unsafe { asm!("csrr {}, satp", out(reg) x) }
        x
    }

    pub fn w_satp(x: usize) {
        unsafe { asm!("csrw satp, {}", in(reg) x) }
    }

    pub fn w_mscratch(x: usize) {
        unsafe { asm!("csrw mscratch, {}", in(reg) x) }
    }

    pub fn sfence_vma() {
        unsafe { asm!("sfence.vma zero, zero") }
    }

    pub fn w_tp(x: u64) {
        unsafe { asm!("mv tp, {}", in(reg) x) }
    }
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub use hart::*;

#[macro_export]
macro_rules! PGROUNDUP {
    ( $a:expr ) => {
        ((($a as usize) + $crate::riscv::PGSIZE - 1) & !($crate::riscv::PGSIZE - 1))
    };
}

#[macro_export]
macro_rules! PGROUNDDOWN {
    ( $a:expr ) => {
        (($a as usize) & !($crate::riscv::PGSIZE - 1))
    };
}

#[macro_export]
macro_rules! MAKE_SATP {
    ( $pagetable:expr ) => {
        ($crate::riscv::SATP_SV39 | (($pagetable as usize) >> $crate::riscv::PGSHIFT))
    };
}
