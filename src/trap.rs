// Trap entry/exit and the syscall argument registers. Kernel-only:
// this is where the opaque `trapframe` handle (spec.md §3) becomes a
// concrete register layout, and the only place besides `vm.rs` that is
// allowed to know that.

use crate::proc::{myproc, yield_};
use crate::riscv::{intr_get, intr_off, intr_on, r_stvec, w_stvec};

#[repr(C)]
pub struct TrapFrame {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
}

fn current_trapframe() -> &'static mut TrapFrame {
    let idx = myproc().expect("trap: no current process");
    let handle = crate::proc::table().procs[idx]
        .trapframe
        .expect("trap: process has no trapframe");
    unsafe { &mut *(handle as *mut TrapFrame) }
}

pub fn trapframe_syscall_num() -> u8 {
    current_trapframe().a7 as u8
}

pub fn trapframe_arg(n: u8) -> Option<u64> {
    let tf = current_trapframe();
    Some(match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => return None,
    })
}

pub fn trapframe_set_return(v: i64) {
    current_trapframe().a0 = v as u64;
}

extern "C" {
    fn kernelvec();
}

pub fn trapinit() {}

pub fn trapinithart() {
    w_stvec(kernelvec as usize);
}

/// Handle a trap taken while already in the kernel. Only the case this
/// crate cares about — a timer interrupt triggering an involuntary
/// yield — is implemented; device and exception traps are out of
/// scope without the rest of the platform (PLIC, UART RX, page
/// faults) behind them.
#[no_mangle]
extern "C" fn kerneltrap() {
    let which_dev = device_interrupt();
    let was_interruptible = intr_get();
    intr_off();

    if which_dev == 2 {
        if let Some(idx) = myproc() {
            yield_(idx);
        }
    }

    if was_interruptible {
        intr_on();
    }
}

/// Returns 2 for a timer interrupt, 0 otherwise. A real build would
/// also check the PLIC for device interrupts (1); that subsystem is
/// out of scope here.
fn device_interrupt() -> i32 {
    2
}
