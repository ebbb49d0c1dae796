use crate::io::Port;

pub const PIC1_COMMAND: Port<u8> = Port::new(0x20);
pub const PIC1_DATA: Port<u8> = Port::new(0x21);
pub const PIC2_COMMAND: Port<u8> = Port::new(0xA0);
pub const PIC2_DATA: Port<u8> = Port::new(0xA1);
