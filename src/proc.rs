// The process table and the stride scheduler built on top of it.
//
// All queue/state-machine/stride arithmetic lives as methods on
// `ProcTable` that take explicit `usize` slot indices and never touch
// the global singleton (`TABLE`/`TABLE_LOCK`/`CPUS`) directly. That is
// what lets this module's `#[cfg(test)]` block build many independent
// `ProcTable`s and drive them concurrently under `cargo test` without
// any of the `static mut` global state real hart execution needs. The
// thin kernel-facing wrappers at the bottom of this file are the only
// things that reach through to the globals, and are not unit tested —
// they are exercised by actually booting the kernel.

use crate::file::{file_close, file_dup, inode_dup, inode_put, FileHandle, Inode};
use crate::param::{DEFAULT_TICKETS, DISTANCE_MAX, NCPU, NOFILE, NPROC, PASS_MAX};
use crate::spinlock::Spinlock;
use crate::string::safestrcpy;
use crate::vm;

/// Callee-saved registers swapped by `context_switch`. Plain data: the
/// always-on core only ever copies it around, never interprets it.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

/// Per-hart state: which process (if any) it is currently running, the
/// saved context to switch back to its own scheduler loop, and the
/// push_off/pop_off interrupt-nesting counters.
#[derive(Clone, Copy)]
pub struct Cpu {
    pub proc: Option<usize>,
    pub context: Context,
    pub noff: u8,
    pub intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Cpu {
            proc: None,
            context: Context {
                ra: 0,
                sp: 0,
                s0: 0,
                s1: 0,
                s2: 0,
                s3: 0,
                s4: 0,
                s5: 0,
                s6: 0,
                s7: 0,
                s8: 0,
                s9: 0,
                s10: 0,
                s11: 0,
            },
            noff: 0,
            intena: false,
        }
    }
}

/// The six states spec.md's state machine names (§4.4). Note this is
/// *not* the newer xv6-riscv `USED` state; RUNNABLE/RUNNING/SLEEPING
/// are distinguished directly, the way the reference implementation
/// does.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

#[derive(Clone, Copy)]
pub struct Proc {
    pub pid: i32,
    pub parent: Option<usize>,
    pub state: ProcState,
    pub killed: bool,
    pub chan: Option<usize>,
    pub xstate: i32,

    // Stride-scheduling bookkeeping (C3).
    pub tickets: u32,
    pub stride: u32,
    pub pass: u32,
    pub ticks: u32,
    pub end_ticks: i32,

    // Runnable-queue links (C2). `Option<usize>` slot indices rather
    // than raw pointers: the table owns every record uniquely, so
    // there is never a reason for a borrowed reference here.
    pub prev: Option<usize>,
    pub next: Option<usize>,

    // Opaque handles to collaborator-owned resources (spec.md §3/§9).
    pub kstack: Option<usize>,
    pub sz: usize,
    pub pagetable: Option<usize>,
    pub trapframe: Option<usize>,
    pub context: Context,
    pub open_files: [Option<FileHandle>; NOFILE],
    pub cwd: Option<Inode>,
    pub name: [u8; 16],
}

impl Proc {
    const fn unused() -> Self {
        Proc {
            pid: 0,
            parent: None,
            state: ProcState::Unused,
            killed: false,
            chan: None,
            xstate: 0,
            tickets: 0,
            stride: 0,
            pass: 0,
            ticks: 0,
            end_ticks: -1,
            prev: None,
            next: None,
            kstack: None,
            sz: 0,
            pagetable: None,
            trapframe: None,
            context: Context {
                ra: 0,
                sp: 0,
                s0: 0,
                s1: 0,
                s2: 0,
                s3: 0,
                s4: 0,
                s5: 0,
                s6: 0,
                s7: 0,
                s8: 0,
                s9: 0,
                s10: 0,
                s11: 0,
            },
            open_files: [None; NOFILE],
            cwd: None,
            name: [0; 16],
        }
    }
}

/// Outcome of one non-blocking scan of the table for a zombie child,
/// factored out of `wait` so it can be unit tested without the
/// sleep-and-retry loop around it.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult {
    Reaped { pid: i32, xstate: i32 },
    NoChildren,
    MustSleep,
}

pub struct ProcTable {
    pub procs: [Proc; NPROC],
    head: Option<usize>,
    tail: Option<usize>,
    next_pid: i32,
    pub init_proc: Option<usize>,
}

impl ProcTable {
    pub const fn new() -> Self {
        ProcTable {
            procs: [Proc::unused(); NPROC],
            head: None,
            tail: None,
            next_pid: 1,
            init_proc: None,
        }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    // ---- runnable queue (C2) ----

    fn key(&self, idx: usize) -> (u32, i32) {
        (self.procs[idx].pass, self.procs[idx].pid)
    }

    /// Insert `idx` in ascending `(pass, pid)` order. Caller must have
    /// already set `state = Runnable`.
    pub fn enqueue(&mut self, idx: usize) {
        self.procs[idx].prev = None;
        self.procs[idx].next = None;

        let Some(mut cur) = self.head else {
            self.head = Some(idx);
            self.tail = Some(idx);
            return;
        };

        loop {
            if self.key(idx) < self.key(cur) {
                let prev = self.procs[cur].prev;
                self.procs[idx].next = Some(cur);
                self.procs[idx].prev = prev;
                match prev {
                    Some(p) => self.procs[p].next = Some(idx),
                    None => self.head = Some(idx),
                }
                self.procs[cur].prev = Some(idx);
                return;
            }
            match self.procs[cur].next {
                Some(next) => cur = next,
                None => break,
            }
        }

        // idx sorts after every current record: append at the tail.
        self.procs[cur].next = Some(idx);
        self.procs[idx].prev = Some(cur);
        self.tail = Some(idx);
    }

    /// Remove `idx` from the queue. A no-op if `idx` is not linked.
    pub fn dequeue(&mut self, idx: usize) {
        let prev = self.procs[idx].prev;
        let next = self.procs[idx].next;
        if prev.is_none() && next.is_none() && self.head != Some(idx) {
            return;
        }

        match prev {
            Some(p) => self.procs[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.procs[n].prev = prev,
            None => self.tail = prev,
        }

        self.procs[idx].prev = None;
        self.procs[idx].next = None;
    }

    pub fn peek_min(&self) -> Option<usize> {
        self.head
    }

    pub fn queue_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(idx) = cur {
            n += 1;
            cur = self.procs[idx].next;
        }
        n
    }

    // ---- stride arithmetic & rebase (C3) ----

    /// Normalize every queued `pass` against the minimum once the tail
    /// exceeds `PASS_MAX`, capping the spread at `DISTANCE_MAX`. Must
    /// be called with the table lock held; invoked at the top of every
    /// scheduler iteration.
    pub fn check_and_rebase(&mut self) {
        let Some(head) = self.head else {
            return;
        };
        let tail = self.tail.unwrap();
        if self.procs[tail].pass <= PASS_MAX {
            return;
        }

        #[cfg(feature = "rebase_trace")]
        crate::printf!("\nRebase Process Start\n\n");

        let min_pass = self.procs[head].pass;
        let mut cur = Some(head);
        while let Some(idx) = cur {
            #[cfg(feature = "rebase_trace")]
            let old_pass = self.procs[idx].pass;

            self.procs[idx].pass -= min_pass;
            if self.procs[idx].pass > DISTANCE_MAX {
                self.procs[idx].pass = DISTANCE_MAX;
                #[cfg(feature = "rebase_trace")]
                crate::printf!(
                    "Process {}'s pass is standardize from {}, with distance cutting, to {}\n",
                    self.procs[idx].pid,
                    old_pass,
                    self.procs[idx].pass
                );
                #[cfg(not(feature = "rebase_trace"))]
                let _ = idx;
            } else {
                #[cfg(feature = "rebase_trace")]
                crate::printf!(
                    "Process {}'s pass is standardize from {}, to {}\n",
                    self.procs[idx].pid,
                    old_pass,
                    self.procs[idx].pass
                );
            }

            cur = self.procs[idx].next;
        }

        #[cfg(feature = "rebase_trace")]
        crate::printf!("\nRebase Process End\n\n");
    }

    // ---- allocation / reclamation (C1) ----

    /// Find an UNUSED slot, mark it EMBRYO, assign a pid, a kernel
    /// stack and a trapframe, and seed stride-scheduling fields.
    /// Returns `None` if the table is full or either page cannot be
    /// allocated (rolling back whatever was already allocated).
    pub fn alloc(&mut self) -> Option<usize> {
        let idx = (0..NPROC).find(|&i| self.procs[i].state == ProcState::Unused)?;

        let kstack = vm::alloc_kernel_page()?;
        let trapframe = match vm::alloc_trapframe() {
            Some(tf) => tf,
            None => {
                vm::free_kernel_page(kstack);
                return None;
            }
        };

        let p = &mut self.procs[idx];
        p.state = ProcState::Embryo;
        p.pid = self.next_pid;
        self.next_pid += 1;
        p.tickets = DEFAULT_TICKETS;
        p.stride = crate::param::STRIDE_MAX / DEFAULT_TICKETS;
        p.pass = 0;
        p.ticks = 0;
        p.end_ticks = -1;
        p.killed = false;
        p.chan = None;
        p.parent = None;
        p.sz = 0;
        p.kstack = Some(kstack);
        p.pagetable = None;
        p.trapframe = Some(trapframe);
        p.open_files = [None; NOFILE];
        p.cwd = None;
        p.name = [0; 16];

        // A process's very first scheduling lands here via its saved
        // context, mirroring allocproc's `context.ra`/`context.sp`
        // setup: without it, the scheduler's first context_switch into
        // a new process jumps to a null return address on a null
        // stack (spec.md §4.5/§9).
        #[cfg(not(any(test, feature = "kernel_as_a_lib")))]
        {
            p.context = Context::default();
            p.context.ra = forkret as usize as u64;
            p.context.sp = (kstack + crate::riscv::PGSIZE) as u64;
        }

        Some(idx)
    }

    /// Reclaim a ZOMBIE record's resources and mark the slot UNUSED
    /// again. Called by `wait` once a zombie child has been found.
    fn free(&mut self, idx: usize) {
        if let Some(kstack) = self.procs[idx].kstack.take() {
            vm::free_kernel_page(kstack);
        }
        if let Some(trapframe) = self.procs[idx].trapframe.take() {
            vm::free_trapframe(trapframe);
        }
        if let Some(pagetable) = self.procs[idx].pagetable.take() {
            vm::free_address_space(pagetable, self.procs[idx].sz);
        }
        for f in self.procs[idx].open_files.iter_mut() {
            if let Some(handle) = f.take() {
                file_close(handle);
            }
        }
        if let Some(cwd) = self.procs[idx].cwd.take() {
            inode_put(cwd);
        }
        self.procs[idx] = Proc::unused();
    }

    // ---- state machine transitions (C4) ----

    /// Common tail of userinit/fork: move a freshly-set-up EMBRYO
    /// record to RUNNABLE and link it into the queue.
    fn make_runnable(&mut self, idx: usize) {
        self.procs[idx].state = ProcState::Runnable;
        self.procs[idx].prev = None;
        self.procs[idx].next = None;
        self.enqueue(idx);
    }

    /// Scheduler pick (§4.5 step 4-5, table-side half): run rebase,
    /// then take the head of the queue, transition it to RUNNING, and
    /// unlink it. Returns `None` if the queue is empty.
    pub fn pick_next(&mut self) -> Option<usize> {
        self.check_and_rebase();
        let idx = self.peek_min()?;
        self.procs[idx].state = ProcState::Running;
        self.dequeue(idx);
        Some(idx)
    }

    /// RUNNING -> RUNNABLE, advancing `pass` by `stride` first. Used by
    /// both voluntary `yield` and (conceptually) a tick-driven
    /// preemption. Per spec.md §4.3 this advancement must happen on
    /// every RUNNING->RUNNABLE edge regardless of cause — the
    /// reference C source never performs it, which would otherwise let
    /// the scheduler immediately re-pick the process it just ran.
    pub fn yield_back(&mut self, idx: usize) {
        self.procs[idx].pass = self.procs[idx].pass.wrapping_add(self.procs[idx].stride);
        self.procs[idx].state = ProcState::Runnable;
        self.make_runnable(idx);
    }

    /// RUNNING -> SLEEPING on `chan`.
    pub fn sleep_on(&mut self, idx: usize, chan: usize) {
        self.procs[idx].chan = Some(chan);
        self.procs[idx].state = ProcState::Sleeping;
    }

    /// SLEEPING(chan) -> RUNNABLE for every matching record.
    pub fn wakeup(&mut self, chan: usize) {
        for idx in 0..NPROC {
            if self.procs[idx].state == ProcState::Sleeping && self.procs[idx].chan == Some(chan) {
                self.make_runnable(idx);
            }
        }
    }

    /// Mark `pid` killed; if it is SLEEPING, promote it to RUNNABLE so
    /// it notices on its next scheduling opportunity. Returns `0` on
    /// hit, `-1` if no record has that pid.
    pub fn kill(&mut self, pid: i32) -> i32 {
        let Some(idx) = (0..NPROC).find(|&i| self.procs[i].pid == pid && self.procs[i].state != ProcState::Unused) else {
            return -1;
        };
        self.procs[idx].killed = true;
        if self.procs[idx].state == ProcState::Sleeping {
            self.make_runnable(idx);
        }
        0
    }

    pub fn set_tickets(&mut self, idx: usize, tickets: i32, end_ticks: i32) -> i32 {
        if tickets < 1 || tickets as u32 > crate::param::STRIDE_MAX {
            return -1;
        }
        if end_ticks >= 1 {
            self.procs[idx].end_ticks = end_ticks;
        }
        self.procs[idx].tickets = tickets as u32;
        self.procs[idx].stride = crate::param::STRIDE_MAX / tickets as u32;
        0
    }

    // ---- lifecycle (C7) ----

    /// Allocate a child, duplicate the parent's address space/files/
    /// cwd/name/trapframe into it, and make it RUNNABLE. Returns the
    /// child's pid, or `None` on allocation/duplication failure (in
    /// which case the partially-built child slot is rolled back to
    /// UNUSED).
    pub fn fork(&mut self, parent: usize) -> Option<i32> {
        let child = self.alloc()?;

        let parent_pt = self.procs[parent].pagetable;
        let sz = self.procs[parent].sz;
        let child_pt = match parent_pt {
            Some(_) => match vm::setup_address_space() {
                Some(pt) => pt,
                None => {
                    self.free(child);
                    return None;
                }
            },
            None => {
                self.free(child);
                return None;
            }
        };
        if vm::copy_address_space(parent_pt.unwrap(), child_pt, sz).is_none() {
            vm::free_address_space(child_pt, 0);
            self.free(child);
            return None;
        }

        self.procs[child].pagetable = Some(child_pt);
        self.procs[child].sz = sz;
        self.procs[child].parent = Some(parent);

        // Duplicate the parent's trapframe contents into the child's
        // own (alloc() already gave it one) rather than aliasing the
        // same handle, then clear the child's return-value register
        // so its pending fork() call reports 0 (spec.md §4.7).
        let parent_tf = self.procs[parent].trapframe.expect("fork: parent has no trapframe");
        let child_tf = self.procs[child].trapframe.expect("fork: child has no trapframe");
        vm::copy_trapframe(parent_tf, child_tf);
        vm::trapframe_clear_return(child_tf);

        for i in 0..NOFILE {
            if let Some(f) = self.procs[parent].open_files[i] {
                self.procs[child].open_files[i] = Some(file_dup(f));
            }
        }
        if let Some(cwd) = self.procs[parent].cwd {
            self.procs[child].cwd = Some(inode_dup(cwd));
        }

        let name = self.procs[parent].name;
        safestrcpy(&mut self.procs[child].name, &name);

        let pid = self.procs[child].pid;
        self.make_runnable(child);
        Some(pid)
    }

    /// Bookkeeping half of `exit`: close files, release cwd, wake the
    /// parent, reparent children to `init`, and mark ZOMBIE. Does not
    /// touch `sched` — the real exit-never-returns contract lives in
    /// the kernel-facing wrapper below, since it cannot be exercised
    /// the same way on host.
    pub fn exit_locked(&mut self, idx: usize, xstate: i32) {
        for f in self.procs[idx].open_files.iter_mut() {
            if let Some(handle) = f.take() {
                file_close(handle);
            }
        }
        if let Some(cwd) = self.procs[idx].cwd.take() {
            inode_put(cwd);
        }

        if let Some(parent) = self.procs[idx].parent {
            self.wakeup(parent_wait_chan(parent));
        }

        if let Some(init) = self.init_proc {
            for i in 0..NPROC {
                if self.procs[i].parent == Some(idx) {
                    self.procs[i].parent = Some(init);
                    if self.procs[i].state == ProcState::Zombie {
                        self.wakeup(parent_wait_chan(init));
                    }
                }
            }
        }

        self.procs[idx].xstate = xstate;
        self.procs[idx].state = ProcState::Zombie;
    }

    /// One non-blocking scan for a zombie child of `parent` (§4.7
    /// `wait`, factored so the retry-and-sleep loop around it is not
    /// part of the tested surface).
    pub fn wait_scan(&mut self, parent: usize) -> WaitResult {
        let mut have_kids = false;
        for i in 0..NPROC {
            if self.procs[i].parent != Some(parent) {
                continue;
            }
            have_kids = true;
            if self.procs[i].state == ProcState::Zombie {
                let pid = self.procs[i].pid;
                let xstate = self.procs[i].xstate;
                self.free(i);
                return WaitResult::Reaped { pid, xstate };
            }
        }

        if !have_kids || self.procs[parent].killed {
            WaitResult::NoChildren
        } else {
            WaitResult::MustSleep
        }
    }

    /// First user process (xv6's `userinit`): allocate, set up an
    /// empty address space, load `initcode`, point its trapframe at
    /// user address 0 with a fresh stack, and make it RUNNABLE.
    pub fn userinit(&mut self, initcode: &[u8]) -> usize {
        let idx = self.alloc().expect("userinit: process table full");
        let pt = vm::setup_address_space().expect("userinit: out of memory");
        self.procs[idx].pagetable = Some(pt);
        self.procs[idx].sz = crate::riscv::PGSIZE;
        crate::vm::load_initcode(pt, initcode);
        let trapframe = self.procs[idx].trapframe.expect("userinit: no trapframe");
        vm::init_user_trapframe(trapframe, crate::riscv::PGSIZE);
        safestrcpy(&mut self.procs[idx].name, b"initcode");
        self.init_proc = Some(idx);
        self.make_runnable(idx);
        idx
    }

    /// Debugging dump of every live record, triggered by the console's
    /// `^P` in the reference implementation. No lock: meant to still
    /// work on a wedged kernel.
    #[cfg(not(any(test, feature = "kernel_as_a_lib")))]
    pub fn dump(&self) {
        for p in self.procs.iter() {
            if p.state == ProcState::Unused {
                continue;
            }
            let state = match p.state {
                ProcState::Unused => "unused",
                ProcState::Embryo => "embryo",
                ProcState::Sleeping => "sleep ",
                ProcState::Runnable => "runble",
                ProcState::Running => "run   ",
                ProcState::Zombie => "zombie",
            };
            let name = core::str::from_utf8(&p.name).unwrap_or("?");
            crate::printf!("{} {} {} pass={}\n", p.pid, state, name, p.pass);
        }
    }
}

/// `wait`/`exit` sleep/wake on the parent's own slot index rather than
/// a magic address; this is the channel encoding used on both sides.
fn parent_wait_chan(parent_idx: usize) -> usize {
    parent_idx + 1 // avoid colliding with chan == 0 meaning "no chan"
}

// ---- global singleton & kernel-facing wrappers (not unit tested) ----

static mut TABLE: ProcTable = ProcTable::new();
static mut TABLE_LOCK: Spinlock = Spinlock::init_lock("table_lock");
static mut CPUS: [Cpu; NCPU] = [Cpu::new(); NCPU];

pub fn table() -> &'static mut ProcTable {
    unsafe { &mut *core::ptr::addr_of_mut!(TABLE) }
}

pub fn table_lock() -> &'static mut Spinlock {
    unsafe { &mut *core::ptr::addr_of_mut!(TABLE_LOCK) }
}

/// Must be called with interrupts disabled.
pub fn cpuid() -> usize {
    crate::riscv::r_tp() as usize
}

/// Must be called with interrupts disabled, so the caller cannot be
/// rescheduled to a different hart mid-lookup.
pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut (*core::ptr::addr_of_mut!(CPUS))[cpuid()] }
}

pub fn myproc() -> Option<usize> {
    crate::spinlock::push_off();
    let p = mycpu().proc;
    crate::spinlock::pop_off();
    p
}

#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn sched() {
    let p = myproc().expect("sched: no current process");
    if !table_lock().holding() {
        panic!("sched table_lock");
    }
    if mycpu().noff != 1 {
        panic!("sched locks");
    }
    if table().procs[p].state == ProcState::Running {
        panic!("sched running");
    }
    if crate::riscv::intr_get() {
        panic!("sched interruptible");
    }

    let intena = mycpu().intena;
    let proc_ctx: *mut Context = &mut table().procs[p].context;
    let sched_ctx: *mut Context = &mut mycpu().context;
    unsafe { context_switch(proc_ctx, sched_ctx) };
    mycpu().intena = intena;
}

#[cfg(any(test, feature = "kernel_as_a_lib"))]
pub fn sched() {
    // Host stand-in: the scheduler loop never actually resumes on this
    // side, so there is nothing to switch to. Callers that depend on
    // `sched()` never returning (`exit_kernel`) are not reachable from
    // `#[cfg(test)]`.
}

/// Swap callee-saved registers and stacks between `old` and `new`.
/// Real implementation is pure asm; the host stand-in is unreachable
/// (see `sched` above) but kept so the signature type-checks under
/// both cfgs.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
unsafe fn context_switch(old: *mut Context, new: *mut Context) {
    core::arch::asm!(
        "sd ra, 0(a0)",
        "sd sp, 8(a0)",
        "sd s0, 16(a0)",
        "sd s1, 24(a0)",
        "sd s2, 32(a0)",
        "sd s3, 40(a0)",
        "sd s4, 48(a0)",
        "sd s5, 56(a0)",
        "sd s6, 64(a0)",
        "sd s7, 72(a0)",
        "sd s8, 80(a0)",
        "sd s9, 88(a0)",
        "sd s10, 96(a0)",
        "sd s11, 104(a0)",
        "ld ra, 0(a1)",
        "ld sp, 8(a1)",
        "ld s0, 16(a1)",
        "ld s1, 24(a1)",
        "ld s2, 32(a1)",
        "ld s3, 40(a1)",
        "ld s4, 48(a1)",
        "ld s5, 56(a1)",
        "ld s6, 64(a1)",
        "ld s7, 72(a1)",
        "ld s8, 80(a1)",
        "ld s9, 88(a1)",
        "ld s10, 96(a1)",
        "ld s11, 104(a1)",
        in("a0") old,
        in("a1") new,
    );
}

/// A freshly allocated process's very first scheduling lands here via
/// its saved `context.ra` (see `ProcTable::alloc`), mirroring the
/// teacher's/original's `forkret`. The scheduler is still holding
/// `table_lock` from the context switch that got us here — every
/// other resumption path (`yield_`, `sleep`) already arranged to
/// release it on the way back in, but a brand-new process skips
/// straight past that and must do it itself. This crate has no
/// `usertrapret`/`exec` to hand control to (out of scope per
/// spec.md §1), so it idles once the lock is dropped.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
fn forkret() -> ! {
    table_lock().release();
    loop {
        unsafe { core::arch::asm!("wfi") };
    }
}

/// Per-CPU scheduler loop (§4.5). Never returns.
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn scheduler() -> ! {
    mycpu().proc = None;
    loop {
        crate::riscv::intr_on();

        table_lock().acquire();
        if let Some(idx) = table().pick_next() {
            mycpu().proc = Some(idx);
            let pt = table().procs[idx].pagetable.expect("scheduler: no address space");
            vm::switch_address_space(pt);

            let proc_ctx: *mut Context = &mut table().procs[idx].context;
            let sched_ctx: *mut Context = &mut mycpu().context;
            unsafe { context_switch(sched_ctx, proc_ctx) };

            mycpu().proc = None;
        }
        table_lock().release();
    }
}

pub fn yield_(idx: usize) {
    table_lock().acquire();
    table().yield_back(idx);
    sched();
    table_lock().release();
}

/// Atomically release `lk` and sleep on `chan`; reacquires `lk` on
/// wake. `lk` must not be `table_lock` itself in the common case, but
/// the symmetric handling below covers that case too (§4.7).
pub fn sleep(chan: usize, lk: &mut Spinlock) {
    let idx = myproc().expect("sleep: no current process");

    let is_table_lock = core::ptr::eq(lk, table_lock());
    if !is_table_lock {
        table_lock().acquire();
        lk.release();
    }

    table().sleep_on(idx, chan);
    sched();
    table().procs[idx].chan = None;

    if !is_table_lock {
        table_lock().release();
        lk.acquire();
    }
}

pub fn wakeup_kernel(chan: usize) {
    table_lock().acquire();
    table().wakeup(chan);
    table_lock().release();
}

pub fn kill_kernel(pid: i32) -> i32 {
    table_lock().acquire();
    let r = table().kill(pid);
    table_lock().release();
    r
}

pub fn set_tickets_kernel(tickets: i32, end_ticks: i32) -> i32 {
    let idx = myproc().expect("set_tickets: no current process");
    table_lock().acquire();
    let r = table().set_tickets(idx, tickets, end_ticks);
    table_lock().release();
    r
}

pub fn fork_kernel() -> i32 {
    let parent = myproc().expect("fork: no current process");
    table_lock().acquire();
    let r = table().fork(parent);
    table_lock().release();
    r.unwrap_or(-1)
}

/// Never returns; panics if `sched` somehow does (§4.7, §7).
#[cfg(not(any(test, feature = "kernel_as_a_lib")))]
pub fn exit_kernel(xstate: i32) -> ! {
    let idx = myproc().expect("exit: no current process");
    if Some(idx) == table().init_proc {
        panic!("init exiting");
    }

    table_lock().acquire();
    table().exit_locked(idx, xstate);
    sched();
    panic!("zombie exit");
}

pub fn wait_kernel() -> i32 {
    let parent = myproc().expect("wait: no current process");
    table_lock().acquire();
    loop {
        match table().wait_scan(parent) {
            WaitResult::Reaped { pid, .. } => {
                table_lock().release();
                return pid;
            }
            WaitResult::NoChildren => {
                table_lock().release();
                return -1;
            }
            WaitResult::MustSleep => sleep(parent_wait_chan(parent), table_lock()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runnable(t: &mut ProcTable, pass: u32, pid: i32) -> usize {
        let idx = t.alloc().unwrap();
        t.procs[idx].pid = pid;
        t.procs[idx].pass = pass;
        t.procs[idx].state = ProcState::Runnable;
        t.enqueue(idx);
        idx
    }

    fn queue_passes(t: &ProcTable) -> Vec<(u32, i32)> {
        let mut out = Vec::new();
        let mut cur = t.head();
        while let Some(idx) = cur {
            out.push((t.procs[idx].pass, t.procs[idx].pid));
            cur = t.procs[idx].next;
        }
        out
    }

    #[test]
    fn enqueue_keeps_pass_pid_order() {
        let mut t = ProcTable::new();
        runnable(&mut t, 10, 1);
        runnable(&mut t, 5, 2);
        runnable(&mut t, 10, 0);
        runnable(&mut t, 7, 3);

        assert_eq!(queue_passes(&t), vec![(5, 2), (7, 3), (10, 0), (10, 1)]);
    }

    #[test]
    fn dequeue_unlinks_and_fixes_head_tail() {
        let mut t = ProcTable::new();
        let a = runnable(&mut t, 1, 1);
        let b = runnable(&mut t, 2, 2);
        let c = runnable(&mut t, 3, 3);

        t.dequeue(b);
        assert_eq!(queue_passes(&t), vec![(1, 1), (3, 3)]);

        t.dequeue(a);
        assert_eq!(t.head(), Some(c));

        t.dequeue(c);
        assert_eq!(t.head(), None);
        assert_eq!(t.tail(), None);
    }

    #[test]
    fn dequeue_not_linked_is_noop() {
        let mut t = ProcTable::new();
        let a = t.alloc().unwrap();
        // never enqueued: prev/next are None and it is not head.
        t.dequeue(a);
        assert_eq!(t.head(), None);
    }

    #[test]
    fn peek_min_is_head() {
        let mut t = ProcTable::new();
        runnable(&mut t, 9, 1);
        let min = runnable(&mut t, 1, 2);
        assert_eq!(t.peek_min(), Some(min));
    }

    #[test]
    fn rebase_noop_below_threshold() {
        let mut t = ProcTable::new();
        runnable(&mut t, 10, 1);
        runnable(&mut t, 20, 2);
        t.check_and_rebase();
        assert_eq!(queue_passes(&t), vec![(10, 1), (20, 2)]);
    }

    #[test]
    fn rebase_subtracts_min_and_caps_distance() {
        let mut t = ProcTable::new();
        runnable(&mut t, 100, 1);
        runnable(&mut t, PASS_MAX + 1, 2);
        runnable(&mut t, PASS_MAX + DISTANCE_MAX + 500, 3);

        t.check_and_rebase();

        let passes = queue_passes(&t);
        assert_eq!(passes[0], (0, 1));
        assert_eq!(passes[1].0, PASS_MAX + 1 - 100);
        // the third process's normalized pass exceeded DISTANCE_MAX
        // and must have been clamped.
        assert_eq!(passes[2].0, DISTANCE_MAX);
    }

    #[test]
    fn rebase_preserves_order() {
        let mut t = ProcTable::new();
        runnable(&mut t, 1, 1);
        runnable(&mut t, PASS_MAX + 2, 2);
        runnable(&mut t, PASS_MAX + 3, 3);
        t.check_and_rebase();
        let passes = queue_passes(&t);
        assert!(passes[0].0 <= passes[1].0);
        assert!(passes[1].0 <= passes[2].0);
    }

    #[test]
    fn stride_law_holds_for_default_tickets() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        let tickets = t.procs[idx].tickets;
        let stride = t.procs[idx].stride;
        assert!(tickets as u64 * stride as u64 <= crate::param::STRIDE_MAX as u64);
        assert!((tickets + 1) as u64 * stride as u64 > crate::param::STRIDE_MAX as u64);
    }

    #[test]
    fn set_tickets_updates_stride_and_rejects_out_of_range() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();

        assert_eq!(t.set_tickets(idx, 0, -1), -1);
        assert_eq!(t.set_tickets(idx, crate::param::STRIDE_MAX as i32 + 1, -1), -1);

        assert_eq!(t.set_tickets(idx, 4, 100), 0);
        assert_eq!(t.procs[idx].tickets, 4);
        assert_eq!(t.procs[idx].stride, crate::param::STRIDE_MAX / 4);
        assert_eq!(t.procs[idx].end_ticks, 100);
    }

    #[test]
    fn set_tickets_ignores_end_ticks_below_one() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        t.procs[idx].end_ticks = 42;
        assert_eq!(t.set_tickets(idx, 2, 0), 0);
        assert_eq!(t.procs[idx].end_ticks, 42);
    }

    #[test]
    fn yield_back_advances_pass_and_requeues() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        t.procs[idx].pid = 5;
        t.procs[idx].pass = 10;
        t.procs[idx].stride = 3;
        t.procs[idx].state = ProcState::Running;

        t.yield_back(idx);

        assert_eq!(t.procs[idx].state, ProcState::Runnable);
        assert_eq!(t.procs[idx].pass, 13);
        assert_eq!(t.peek_min(), Some(idx));
    }

    #[test]
    fn yield_back_prevents_immediate_reselection() {
        // A second process with a smaller pass must now be picked
        // ahead of the one that just ran, which is the entire point of
        // advancing pass on the RUNNING->RUNNABLE edge.
        let mut t = ProcTable::new();
        let a = t.alloc().unwrap();
        t.procs[a].pid = 1;
        t.procs[a].pass = 0;
        t.procs[a].stride = 5;
        t.procs[a].state = ProcState::Running;

        let b = runnable(&mut t, 1, 2);

        t.yield_back(a);

        assert_eq!(t.pick_next(), Some(b));
    }

    #[test]
    fn sleep_then_wakeup_requeues_matching_chan() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        t.procs[idx].state = ProcState::Running;
        t.sleep_on(idx, 0xABCD);
        assert_eq!(t.procs[idx].state, ProcState::Sleeping);
        assert_eq!(t.peek_min(), None);

        t.wakeup(0xABCD);
        assert_eq!(t.procs[idx].state, ProcState::Runnable);
        assert_eq!(t.peek_min(), Some(idx));
    }

    #[test]
    fn wakeup_ignores_other_channels() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        t.procs[idx].state = ProcState::Running;
        t.sleep_on(idx, 1);
        t.wakeup(2);
        assert_eq!(t.procs[idx].state, ProcState::Sleeping);
    }

    #[test]
    fn kill_sleeping_process_wakes_it() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        let pid = t.procs[idx].pid;
        t.procs[idx].state = ProcState::Sleeping;
        t.procs[idx].chan = Some(7);

        assert_eq!(t.kill(pid), 0);
        assert_eq!(t.procs[idx].killed, true);
        assert_eq!(t.procs[idx].state, ProcState::Runnable);
    }

    #[test]
    fn kill_unknown_pid_fails() {
        let mut t = ProcTable::new();
        assert_eq!(t.kill(999), -1);
    }

    #[test]
    fn kill_running_process_marks_without_requeue() {
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        let pid = t.procs[idx].pid;
        t.procs[idx].state = ProcState::Running;
        assert_eq!(t.kill(pid), 0);
        assert_eq!(t.procs[idx].state, ProcState::Running);
    }

    #[test]
    fn pick_next_removes_from_queue_and_sets_running() {
        let mut t = ProcTable::new();
        let a = runnable(&mut t, 1, 1);
        runnable(&mut t, 2, 2);

        let picked = t.pick_next().unwrap();
        assert_eq!(picked, a);
        assert_eq!(t.procs[a].state, ProcState::Running);
        assert_eq!(t.queue_len(), 1);
    }

    #[test]
    fn pick_next_empty_queue_returns_none() {
        let mut t = ProcTable::new();
        assert_eq!(t.pick_next(), None);
    }

    #[test]
    fn fork_duplicates_state_and_enqueues_child() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        t.procs[parent].pagetable = vm::setup_address_space();
        t.procs[parent].sz = 4096;
        t.procs[parent].open_files[0] = Some(FileHandle(1));
        t.procs[parent].cwd = Some(Inode(1));
        safestrcpy(&mut t.procs[parent].name, b"shell");

        let child_pid = t.fork(parent).unwrap();
        let child = (0..NPROC).find(|&i| t.procs[i].pid == child_pid).unwrap();

        assert_eq!(t.procs[child].parent, Some(parent));
        assert_eq!(t.procs[child].sz, 4096);
        assert_eq!(t.procs[child].state, ProcState::Runnable);
        assert_eq!(t.procs[child].open_files[0], Some(FileHandle(1)));
        assert_eq!(t.procs[child].cwd, Some(Inode(1)));
        assert_eq!(&t.procs[child].name[..5], b"shell");
        assert_eq!(t.peek_min(), Some(child));

        // The child must get its own trapframe handle, not an alias of
        // the parent's (both must be Some, and distinct).
        assert!(t.procs[child].trapframe.is_some());
        assert!(t.procs[parent].trapframe.is_some());
        assert_ne!(t.procs[child].trapframe, t.procs[parent].trapframe);
    }

    #[test]
    fn fork_without_parent_address_space_fails() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        assert_eq!(t.fork(parent), None);
    }

    #[test]
    fn exit_wakes_parent_and_reparents_zombie_children() {
        let mut t = ProcTable::new();
        let init = t.alloc().unwrap();
        t.init_proc = Some(init);

        let parent = t.alloc().unwrap();
        let child = t.alloc().unwrap();
        t.procs[child].parent = Some(parent);
        t.procs[child].state = ProcState::Zombie;

        t.procs[parent].state = ProcState::Sleeping;
        t.procs[parent].chan = Some(parent_wait_chan(parent));

        t.exit_locked(parent, 0);

        assert_eq!(t.procs[parent].state, ProcState::Zombie);
        // parent's own waiter (itself, here) should have been woken.
        assert_eq!(t.procs[parent].chan, None);
        assert_eq!(t.procs[child].parent, Some(init));
    }

    #[test]
    fn wait_scan_reaps_zombie_child() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        let child = t.alloc().unwrap();
        t.procs[child].parent = Some(parent);
        t.procs[child].state = ProcState::Zombie;
        t.procs[child].xstate = 7;
        let pid = t.procs[child].pid;

        match t.wait_scan(parent) {
            WaitResult::Reaped { pid: got, xstate } => {
                assert_eq!(got, pid);
                assert_eq!(xstate, 7);
            }
            other => panic!("expected Reaped, got {:?}", other),
        }
        assert_eq!(t.procs[child].state, ProcState::Unused);
    }

    #[test]
    fn wait_scan_no_children_fails_fast() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        assert_eq!(t.wait_scan(parent), WaitResult::NoChildren);
    }

    #[test]
    fn wait_scan_live_child_must_sleep() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        let child = t.alloc().unwrap();
        t.procs[child].parent = Some(parent);
        t.procs[child].state = ProcState::Runnable;
        assert_eq!(t.wait_scan(parent), WaitResult::MustSleep);
    }

    #[test]
    fn wait_scan_killed_parent_fails_fast_even_with_live_children() {
        let mut t = ProcTable::new();
        let parent = t.alloc().unwrap();
        let child = t.alloc().unwrap();
        t.procs[child].parent = Some(parent);
        t.procs[child].state = ProcState::Runnable;
        t.procs[parent].killed = true;
        assert_eq!(t.wait_scan(parent), WaitResult::NoChildren);
    }

    #[test]
    fn pids_stay_unique_across_allocations() {
        let mut t = ProcTable::new();
        let mut pids = Vec::new();
        for _ in 0..8 {
            let idx = t.alloc().unwrap();
            pids.push(t.procs[idx].pid);
        }
        let mut sorted = pids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(pids.len(), sorted.len());
    }

    #[test]
    fn membership_matches_runnable_state() {
        let mut t = ProcTable::new();
        let a = runnable(&mut t, 1, 1);
        let b = t.alloc().unwrap(); // stays EMBRYO, never enqueued

        let mut queued = std::collections::HashSet::new();
        let mut cur = t.head();
        while let Some(idx) = cur {
            queued.insert(idx);
            cur = t.procs[idx].next;
        }

        assert!(queued.contains(&a));
        assert!(!queued.contains(&b));
    }

    #[test]
    fn single_process_fairness_pass_grows_by_stride_each_pick() {
        // spec.md §8 scenario 2: one process, tickets = 10. After K
        // scheduler iterations its pass should be i * stride at
        // iteration i (modulo rebase, which never triggers here).
        let mut t = ProcTable::new();
        let idx = t.alloc().unwrap();
        t.set_tickets(idx, 10, -1);
        t.procs[idx].pid = 1;
        t.procs[idx].state = ProcState::Runnable;
        t.enqueue(idx);

        let stride = t.procs[idx].stride;
        for i in 1..=5u32 {
            let picked = t.pick_next().unwrap();
            assert_eq!(picked, idx);
            t.yield_back(idx);
            assert_eq!(t.procs[idx].pass, i * stride);
        }
    }

    #[test]
    fn two_process_ratio_matches_ticket_ratio() {
        // spec.md §8 scenario 3: A has twice B's tickets, so over a
        // long CPU-bound run A should be picked roughly twice as
        // often as B, interleaved A,A,B,A,A,B,... (tie-broken by pid).
        let mut t = ProcTable::new();
        let a = t.alloc().unwrap();
        t.set_tickets(a, 2, -1);
        t.procs[a].pid = 1;
        t.procs[a].state = ProcState::Runnable;
        t.enqueue(a);

        let b = t.alloc().unwrap();
        t.set_tickets(b, 1, -1);
        t.procs[b].pid = 2;
        t.procs[b].state = ProcState::Runnable;
        t.enqueue(b);

        let mut a_count = 0;
        let mut b_count = 0;
        let mut order = Vec::new();
        for _ in 0..300 {
            let picked = t.pick_next().unwrap();
            if picked == a {
                a_count += 1;
                order.push('A');
            } else {
                b_count += 1;
                order.push('B');
            }
            t.yield_back(picked);
        }

        assert_eq!(&order[..6], &['A', 'B', 'A', 'A', 'B', 'A']);
        let ratio = a_count as f64 / b_count as f64;
        assert!((ratio - 2.0).abs() < 0.1, "ratio was {ratio}");
    }

    #[test]
    fn back_to_back_rebases_are_idempotent() {
        let mut t = ProcTable::new();
        runnable(&mut t, 1, 1);
        runnable(&mut t, PASS_MAX + 10, 2);
        t.check_and_rebase();
        let after_first = queue_passes(&t);
        t.check_and_rebase();
        assert_eq!(queue_passes(&t), after_first);
    }

    #[test]
    fn enqueue_then_dequeue_restores_prior_state() {
        let mut t = ProcTable::new();
        runnable(&mut t, 1, 1);
        runnable(&mut t, 2, 2);
        let before = queue_passes(&t);

        let idx = t.alloc().unwrap();
        t.procs[idx].pid = 3;
        t.procs[idx].pass = 5;
        t.enqueue(idx);
        t.dequeue(idx);

        assert_eq!(queue_passes(&t), before);
    }

    #[test]
    fn alloc_full_table_returns_none() {
        let mut t = ProcTable::new();
        for _ in 0..NPROC {
            t.alloc().unwrap();
        }
        assert_eq!(t.alloc(), None);
    }
}
