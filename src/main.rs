#![cfg_attr(not(any(test, feature = "kernel_as_a_lib")), no_std)]
#![cfg_attr(not(any(test, feature = "kernel_as_a_lib")), no_main)]

// Modules reachable from the host-testable core (spec.md's process
// table and scheduler, plus what it needs): always compiled, whether
// we are building the real riscv64 kernel, running `cargo test`, or
// building `--features kernel_as_a_lib` as an ordinary hosted library.
pub mod file;
pub mod param;
pub mod proc;
pub mod riscv;
pub mod spinlock;
pub mod string;
pub mod vm;

// Kernel-only: boot glue, MMIO drivers, trap handling and the syscall
// table. None of these build on a host target — they rely on riscv
// inline asm and on hardware that does not exist there.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod console;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod kalloc;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod klog;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod memlayout;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod printf;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod start;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod syscall;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod trap;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
mod uart;

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use core::alloc::{GlobalAlloc, Layout};
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use crate::kalloc::KMem;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use crate::proc::cpuid;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
use crate::riscv::__sync_synchronize;

/// Userspace initcode run by the very first process (spec.md's
/// `userinit`). This scheduler core never implements `exec`, so it is
/// just enough to make a RUNNABLE record exist; a real platform image
/// would replace this with an assembled initcode.S binary blob.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
static INITCODE: [u8; 4] = [0x73, 0x00, 0x00, 0x00]; // ecall; loops via the trap handler

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    printf!("Aborting: \n");
    if let Some(p) = info.location() {
        printf!("line {}, file {}: {}\n", p.line(), p.file(), info.message());
    } else {
        printf!("no information available.\n");
    }
    abort()
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
#[no_mangle]
extern "C" fn abort() -> ! {
    loop {
        unsafe { core::arch::asm!("wfi") }
    }
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
struct NoopAllocator;
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
unsafe impl Sync for NoopAllocator {}
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
unsafe impl GlobalAlloc for NoopAllocator {
    unsafe fn alloc(&self, _layout: Layout) -> *mut u8 {
        todo!()
    }
    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        todo!()
    }
}
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
#[global_allocator]
static ALLOCATOR: NoopAllocator = NoopAllocator;

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
static STARTED: AtomicBool = AtomicBool::new(false);

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
#[no_mangle]
pub extern "C" fn kmain() {
    if cpuid() == 0 {
        crate::printf::Printer::init();
        printf!("\nstride-os kernel is booting...\n\n");

        KMem::kinit();
        klog::init();
        log::info!("physical page allocator initialized");

        trap::trapinit();
        trap::trapinithart();
        log::info!("trap vectors installed");

        proc::table().userinit(&INITCODE);
        log::info!("first user process initialized");

        __sync_synchronize();
        STARTED.store(true, Ordering::Relaxed);
        printf!("\nsystem boot successful\n");
    } else {
        while !STARTED.load(Ordering::Relaxed) {}
        __sync_synchronize();
        log::info!("hart {} starting", cpuid());
        trap::trapinithart();
    }

    proc::scheduler();
}
