// System-call numbers and dispatch. Trimmed to the subset relevant to
// the process table and scheduler (spec.md §6); file/exec/pipe syscalls
// the teacher's syscall table also carried are out of scope without a
// real file system behind them.

mod sysproc;

pub const SYS_FORK: u8 = 1;
pub const SYS_EXIT: u8 = 2;
pub const SYS_WAIT: u8 = 3;
pub const SYS_KILL: u8 = 6;
pub const SYS_SETTICKETS: u8 = 22;

/// Fetch the nth word-sized syscall argument as a signed int. The
/// trapframe is an opaque handle outside this module (spec.md §3);
/// marshaling out of it is itself a collaborator interface
/// (`fetch_int_arg`, spec.md §6), implemented on the real build only,
/// where the handle's actual register layout is known.
pub(crate) fn fetch_int_arg(n: u8) -> Option<i32> {
    crate::trap::trapframe_arg(n).map(|v| v as i32)
}

pub fn syscall() {
    let num = crate::trap::trapframe_syscall_num();

    if num == SYS_EXIT {
        // never returns.
        sysproc::sys_exit();
    }

    let ret = match num {
        SYS_FORK => sysproc::sys_fork(),
        SYS_WAIT => sysproc::sys_wait(),
        SYS_KILL => sysproc::sys_kill(),
        SYS_SETTICKETS => sysproc::sys_settickets(),
        _ => {
            crate::printf!("unknown syscall {}\n", num);
            -1
        }
    };

    crate::trap::trapframe_set_return(ret);
}
