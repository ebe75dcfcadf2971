pub mod lattice;
mod profile;
#[cfg(test)]
mod testbench;
pub mod userbus;
pub mod xilinx;

pub use crate::{
    profile::{Family, Profile},
    userbus::{RegisterBus, UserBus},
};
