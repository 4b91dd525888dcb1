//! COM1, the kernel log's only sink.

use core::fmt::{Arguments, Write};

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use crate::constants::ports::SERIAL_PORT;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        let mut port = unsafe { SerialPort::new(SERIAL_PORT) };
        port.init();
        Mutex::new(port)
    };
}

/// Writes `args` to COM1 under the port lock, so one call is one unbroken line.
pub(crate) fn write_line(args: Arguments) {
    let mut port = COM1.lock();
    port.write_fmt(args).expect("Printing to serial failed");
    port.write_char('\n').expect("Printing to serial failed");
}
