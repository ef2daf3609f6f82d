// Physical memory layout, trimmed to what this crate's always-on core
// and its kernel-only vm/kalloc/uart glue still reference. The
// teacher's PLIC/VIRTIO/TRAMPOLINE mappings belonged to the interrupt
// controller and trap subsystem, both out of scope here (spec.md's
// scope is the process table and scheduler, not a full hardware
// platform), so they are dropped rather than carried along unused.

// qemu puts UART registers here.
pub const UART0: usize = 0x1000_0000;

// the kernel expects there to be RAM for use by the kernel and user
// pages from physical address 0x8000_0000 to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;
