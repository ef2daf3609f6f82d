// Process-lifecycle syscall handlers. Each fetches its own arguments
// and calls straight into the kernel-facing wrappers in `proc.rs`,
// matching the teacher's sysproc.rs shape (one small function per
// syscall, argument fetching inline).

use super::fetch_int_arg;
use crate::proc;

pub(super) fn sys_fork() -> i64 {
    proc::fork_kernel() as i64
}

pub(super) fn sys_exit() -> ! {
    let status = fetch_int_arg(0).unwrap_or(0);
    proc::exit_kernel(status)
}

pub(super) fn sys_wait() -> i64 {
    proc::wait_kernel() as i64
}

pub(super) fn sys_kill() -> i64 {
    match fetch_int_arg(0) {
        Some(pid) => proc::kill_kernel(pid) as i64,
        None => -1,
    }
}

/// `set_tickets(tickets, end_ticks)`, spec.md §4.6.
pub(super) fn sys_settickets() -> i64 {
    match (fetch_int_arg(0), fetch_int_arg(1)) {
        (Some(tickets), Some(end_ticks)) => proc::set_tickets_kernel(tickets, end_ticks) as i64,
        _ => -1,
    }
}
