// Output-only console: a `core::fmt::Write` sink over the UART. The
// teacher's console.rs also ran the input side (interrupt-driven line
// buffer, ^P/^U/backspace handling, a `Devsw` hookup into the file
// table) — none of that exists without the file-system/trap machinery
// it depended on, which is out of scope here, so this keeps only the
// write half `printf!` and `klog` need.

use core::fmt::{Error, Write};

use crate::uart::{putc_sync, uart_init};

pub(crate) static mut CONSOLE_INSTANCE: Console = Console::create();

pub struct Console;

impl Console {
    pub const fn create() -> Self {
        Console
    }

    pub fn init() {
        uart_init();
    }

    pub fn putc(&mut self, c: u8) {
        putc_sync(c);
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        for c in s.bytes() {
            self.putc(c);
        }
        Ok(())
    }
}
