// Kernel tuning constants, in the spirit of xv6's param.h: small,
// compile-time, and sized for a teaching kernel rather than a real
// workload.

pub const NPROC: usize = 64; // maximum number of processes
pub const NCPU: usize = 8; // maximum number of CPUs
pub const NOFILE: usize = 16; // open files per process
pub const NFILE: usize = 100; // open files per system
pub const ROOTDEV: u32 = 1; // device number of file system root disk

// Stride-scheduling constants (spec leaves these to the implementer).
//
// STRIDE_MAX doubles as the maximum ticket count a process may hold
// (I6: stride * tickets <= STRIDE_MAX < stride * (tickets + 1)), so it
// needs enough headroom above zero that `STRIDE_MAX / 1` still leaves
// many stride-sized steps before PASS_MAX forces a rebase.
pub const STRIDE_MAX: u32 = 1 << 20;
// Threshold above which check_and_rebase subtracts the minimum pass
// from every queued process. Set well above STRIDE_MAX so a process
// does not rebase on nearly every scheduling round.
pub const PASS_MAX: u32 = 1 << 24;
// Cap applied to any pass value that remains too large after
// subtracting the minimum. Kept below PASS_MAX so the capped spread
// cannot immediately force another rebase on the very next iteration.
pub const DISTANCE_MAX: u32 = 1 << 22;

// Default ticket allocation for a freshly allocated process. The
// reference C source leaves `tickets` uninitialized (see spec.md §9);
// an implementer must pick a default under which `stride` is
// well-defined. STRIDE_MAX tickets gives stride == 1, the smallest
// possible stride, so a process that never calls set_tickets still
// makes forward progress instead of getting stride == 0 and
// monopolizing the CPU.
pub const DEFAULT_TICKETS: u32 = STRIDE_MAX;
