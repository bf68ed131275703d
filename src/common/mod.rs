pub mod addr;
pub mod dialer;

pub use addr::{read_target_addr, AddrError, Address, ByteReader};
pub use dialer::{DirectDialer, Dialer};
