//! In-memory [`RegisterBus`] for exercising board routines without a TAP.

use std::collections::{HashMap, VecDeque};

use cartprobe_io::Fault;
use eyre::Result;

use crate::RegisterBus;

/// Whatever answers the IO space behind a [`FakeBus`].
pub(crate) trait Device {
    fn write_io(&mut self, address: u32, byte: u8);

    fn read_io(&mut self, address: u32) -> u8;

    fn memory_read(&mut self, _address: u32) {}

    /// Last chance to mangle data on its way into memory.
    fn memory_write(&mut self, _address: u32, _data: &mut [u8]) {}
}

/// Plain byte-per-address IO space.
#[derive(Default)]
pub(crate) struct IoMap(pub HashMap<u32, u8>);

impl Device for IoMap {
    fn write_io(&mut self, address: u32, byte: u8) {
        self.0.insert(address, byte);
    }

    fn read_io(&mut self, address: u32) -> u8 {
        self.0.get(&address).copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub(crate) struct FakeBus<D> {
    pub device: D,
    pub memory: HashMap<u32, u8>,
    pub fifos: HashMap<u8, VecDeque<u8>>,
    pub outputs: Vec<u8>,
    /// Every IO write, in order.
    pub io_writes: Vec<(u32, Vec<u8>)>,
}

impl<D> FakeBus<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            memory: HashMap::new(),
            fifos: HashMap::new(),
            outputs: Vec::new(),
            io_writes: Vec::new(),
        }
    }

    pub fn memory_bytes(&self, address: u32, len: usize) -> Vec<u8> {
        (address..address + len as u32)
            .map(|a| self.memory.get(&a).copied().unwrap_or(0))
            .collect()
    }

    pub fn writes_to(&self, address: u32) -> Vec<&[u8]> {
        self.io_writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, d)| d.as_slice())
            .collect()
    }
}

impl<D: Device> RegisterBus for FakeBus<D> {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut data = data.to_vec();
        self.device.memory_write(address, &mut data);
        for (a, b) in (address..).zip(data) {
            self.memory.insert(a, b);
        }
        Ok(())
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.device.memory_read(address);
        Ok(self.memory_bytes(address, len))
    }

    fn read_fifo(&mut self, max: usize, channel: u8, stop_on_empty: bool) -> Result<Vec<u8>> {
        let fifo = self.fifos.entry(channel).or_default();
        if fifo.is_empty() && !stop_on_empty {
            return Err(Fault::communication("no read data").into());
        }
        let n = max.min(fifo.len());
        Ok(fifo.drain(..n).collect())
    }

    fn write_io(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.io_writes.push((address, data.to_vec()));
        for (a, b) in (address..).zip(data) {
            self.device.write_io(a, *b);
        }
        Ok(())
    }

    fn read_io(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        Ok((address..address + len as u32)
            .map(|a| self.device.read_io(a))
            .collect())
    }

    fn set_outputs(&mut self, value: u8) -> Result<()> {
        self.outputs.push(value);
        Ok(())
    }
}
