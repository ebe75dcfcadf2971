mod backend;
pub mod cables;
mod fault;
pub mod ftdi;
pub mod jtag;
mod session;
pub mod sim;
pub mod units;
mod utils;

pub use crate::{
    backend::{Backend, BitOrder, Buffer},
    fault::{Fault, FaultExt, FaultKind},
    session::{BURST_LEN, Session},
    utils::{Hex, ShortHex, SpaceHex, from_lsb_bytes, to_lsb_bytes},
};
