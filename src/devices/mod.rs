//! Device access needed during early boot.
//!
//! Only the COM1 serial port, which carries the kernel log.

pub(crate) mod serial;
