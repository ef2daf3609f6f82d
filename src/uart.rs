// Minimal polling UART driver (ns16550a), kernel-only. The teacher's
// copy also buffered interrupt-driven transmit and console input; this
// crate's scope is the process table and scheduler, not a console
// subsystem, so only the synchronous `putc` path `printf!`/`klog`
// needs is kept.

use crate::memlayout::UART0;
use crate::spinlock::{pop_off, push_off};

const THR: usize = 0; // transmit holding register
const LCR: usize = 3; // line control register
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7;
const FCR: usize = 2;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const IER: usize = 1;
const LSR: usize = 5;
const LSR_TX_IDLE: u8 = 1 << 5;

unsafe fn reg(offset: usize) -> *mut u8 {
    (UART0 + offset) as *mut u8
}

pub fn uart_init() {
    unsafe {
        reg(IER).write_volatile(0x00);
        reg(LCR).write_volatile(LCR_BAUD_LATCH);
        reg(0).write_volatile(0x03); // 38.4K baud, LSB
        reg(1).write_volatile(0x00); // MSB
        reg(LCR).write_volatile(LCR_EIGHT_BITS);
        reg(FCR).write_volatile(FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);
        reg(IER).write_volatile(0x00);
    }
}

/// Spin until the transmit holding register is empty, then write one
/// byte. Safe to call from `printf!`, which may run with interrupts
/// disabled.
pub fn putc_sync(c: u8) {
    push_off();
    unsafe {
        while reg(LSR).read_volatile() & LSR_TX_IDLE == 0 {}
        reg(THR).write_volatile(c);
    }
    pop_off();
}
