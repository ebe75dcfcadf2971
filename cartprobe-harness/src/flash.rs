//! SPI flash behind the design's flash bridge, and the image layouts the
//! boards boot from.
//!
//! The bridge mirrors its data register over the eight IO addresses below the
//! control register, so one IO transfer moves at most [`WINDOW`] bytes over
//! SPI. Chip select is held for as many transfers as a command needs.

use std::io::Read;

use cartprobe_fpga::{Profile, UserBus};
use cartprobe_io::{Backend, Fault, FaultExt, FaultKind, Session, ShortHex};
use eyre::{Result, WrapErr, bail, ensure};
use facet::Facet;
use tracing::{debug, info, instrument, warn};

use crate::{
    RegisterBus,
    regmap::{FLASH_CTRL, FLASH_DATA},
};

pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;
/// Images are read, written and verified in chunks of this size.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Flash commands carry 24 bit addresses.
pub const ADDRESS_SPACE: usize = 1 << 24;

const WINDOW: usize = 8;
const CTRL_SELECT: u8 = 0x01;
const CTRL_IDLE: u8 = 0x03;

/// Status polls before an erase or program is declared hung.
const BUSY_POLLS: usize = 10_000;
const STATUS_WIP: u8 = 1 << 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Command {
    PageProgram = 0x02,
    Read = 0x03,
    ReadStatusReg = 0x05,
    WriteEnable = 0x06,
    SectorErase = 0x20,
    /// 4 dummy bytes, then the 64 bit ID
    ReadUniqueId = 0x4B,
    ReadId = 0x9F,
}

fn with_address(command: Command, address: u32) -> [u8; 4] {
    let [_, a2, a1, a0] = address.to_be_bytes();
    [command as u8, a2, a1, a0]
}

pub struct SpiFlash<'b, R: ?Sized> {
    bus: &'b mut R,
}

impl<'b, R: RegisterBus + ?Sized> SpiFlash<'b, R> {
    pub fn new(bus: &'b mut R) -> Self {
        Self { bus }
    }

    /// One chip-select cycle: send `out`, then clock in `read_len` bytes.
    fn transaction(&mut self, out: &[u8], read_len: usize) -> Result<Vec<u8>> {
        self.bus.write_io(FLASH_CTRL, &[CTRL_SELECT])?;
        let result = self.exchange(out, read_len);
        let deselect = self.bus.write_io(FLASH_CTRL, &[CTRL_IDLE]);
        let data = result?;
        deselect?;
        Ok(data)
    }

    fn exchange(&mut self, out: &[u8], read_len: usize) -> Result<Vec<u8>> {
        for chunk in out.chunks(WINDOW) {
            self.bus.write_io(FLASH_DATA, chunk)?;
        }
        let mut data = Vec::with_capacity(read_len);
        while data.len() < read_len {
            let now = (read_len - data.len()).min(WINDOW);
            let got = self.bus.read_io(FLASH_DATA, now)?;
            if got.len() != now {
                return Err(Fault::communication(format!(
                    "flash bridge returned {} of {now} bytes",
                    got.len()
                ))
                .into());
            }
            data.extend_from_slice(&got);
        }
        Ok(data)
    }

    /// Manufacturer, memory type and capacity bytes.
    pub fn jedec_id(&mut self) -> Result<[u8; 3]> {
        let id = self.transaction(&[Command::ReadId as u8], 3)?;
        Ok([id[0], id[1], id[2]])
    }

    pub fn unique_id(&mut self) -> Result<u64> {
        // clock a dummy byte with the part deselected, ending any command a
        // previous run left half sent
        self.bus.write_io(FLASH_CTRL, &[CTRL_IDLE])?;
        self.bus.write_io(FLASH_DATA, &[0xFF])?;
        let mut out = [0; 5];
        out[0] = Command::ReadUniqueId as u8;
        let id = self.transaction(&out, 8)?;
        let id = u64::from_be_bytes([id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7]]);
        debug!(id = format_args!("{id:016X}"), "flash unique id");
        Ok(id)
    }

    pub fn read_status(&mut self) -> Result<u8> {
        Ok(self.transaction(&[Command::ReadStatusReg as u8], 1)?[0])
    }

    fn write_enable(&mut self) -> Result<()> {
        self.transaction(&[Command::WriteEnable as u8], 0)?;
        Ok(())
    }

    fn wait_idle(&mut self, operation: &str, address: u32) -> Result<()> {
        for _ in 0..BUSY_POLLS {
            if self.read_status()? & STATUS_WIP == 0 {
                return Ok(());
            }
        }
        Err(Fault::critical(format!("flash stuck busy after {operation} at {address:#08X}")).into())
    }

    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        debug!(address = format_args!("{address:#08X}"), "erase sector");
        self.write_enable()?;
        self.transaction(&with_address(Command::SectorErase, address), 0)?;
        self.wait_idle("erase", address)
    }

    /// Program within one page; the part wraps writes that cross a page.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let offset = address as usize % PAGE_SIZE;
        ensure!(
            offset + data.len() <= PAGE_SIZE,
            "{} bytes at {address:#08X} cross a page boundary",
            data.len()
        );
        self.write_enable()?;
        let mut out = with_address(Command::PageProgram, address).to_vec();
        out.extend_from_slice(data);
        self.transaction(&out, 0)?;
        self.wait_idle("program", address)
    }

    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.transaction(&with_address(Command::Read, address), len)
    }

    /// Erase, program and verify one chunk. `address` is sector aligned and
    /// the chunk ends inside [`ADDRESS_SPACE`].
    fn write_chunk(&mut self, address: u32, data: &[u8]) -> Result<()> {
        for sector in (0..data.len()).step_by(SECTOR_SIZE) {
            self.erase_sector(address + sector as u32)?;
        }
        for (i, page) in data.chunks(PAGE_SIZE).enumerate() {
            self.program_page(address + (i * PAGE_SIZE) as u32, page)?;
        }
        let readback = self.read(address, data.len())?;
        if let Some(pos) = readback.iter().zip(data).position(|(a, b)| a != b) {
            let at = pos.saturating_sub(4);
            return Err(Fault::critical(format!(
                "flash verify failed at {:#08X}: wrote {} read {}",
                address as usize + pos,
                ShortHex(&data[at..data.len().min(at + 8)]),
                ShortHex(&readback[at..readback.len().min(at + 8)]),
            ))
            .into());
        }
        Ok(())
    }
}

/// Flash address of `len` bytes found `at` bytes into an image at `offset`.
fn chunk_address(offset: u32, at: usize, len: usize) -> Result<u32> {
    let start = (offset as usize).saturating_add(at);
    if start.saturating_add(len) > ADDRESS_SPACE {
        return Err(Fault::critical(format!(
            "image runs past the end of flash: {len} bytes at {start:#08X}"
        ))
        .into());
    }
    Ok(start as u32)
}

fn percent(done: usize, total: usize) -> u8 {
    match total {
        0 => 100,
        _ => (done.saturating_mul(100) / total).min(100) as u8,
    }
}

/// Write `image` (`size` bytes) to flash at `offset` in [`CHUNK_SIZE`] chunks,
/// verifying each. `on_progress` gets a percentage after every chunk.
#[instrument(skip(bus, image, on_progress))]
pub fn program_flash<R: RegisterBus + ?Sized>(
    bus: &mut R,
    image: &mut dyn Read,
    size: usize,
    offset: u32,
    on_progress: &mut dyn FnMut(u8),
) -> Result<usize> {
    ensure!(
        offset as usize % SECTOR_SIZE == 0,
        "flash offset {offset:#X} is not sector aligned"
    );
    let mut flash = SpiFlash::new(bus);
    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
    let mut written = 0;
    loop {
        chunk.clear();
        Read::take(&mut *image, CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)
            .wrap_err("reading image")?;
        if chunk.is_empty() {
            break;
        }
        flash.write_chunk(chunk_address(offset, written, chunk.len())?, &chunk)?;
        written += chunk.len();
        on_progress(percent(written, size.max(written)));
    }
    if written == 0 {
        bail!("image is empty");
    }
    info!(bytes = written, "flash programmed");
    Ok(written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ImageKind {
    Fpga,
    Application,
    Filesystem,
}

/// Which board's flash map to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Dut,
    Tester,
}

impl Layout {
    pub const fn regions(self) -> &'static [(ImageKind, u32)] {
        match self {
            Layout::Dut => &[
                (ImageKind::Fpga, 0x00_0000),
                (ImageKind::Application, 0x0A_0000),
                (ImageKind::Filesystem, 0x20_0000),
            ],
            Layout::Tester => &[(ImageKind::Fpga, 0x00_0000)],
        }
    }

    pub fn offset(self, kind: ImageKind) -> Option<u32> {
        self.regions()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, offset)| *offset)
    }
}

pub struct FlashImage<'a> {
    pub kind: ImageKind,
    pub reader: &'a mut dyn Read,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ImageResult {
    pub image: String,
    pub offset: Option<u32>,
    pub bytes: usize,
    pub error: Option<String>,
}

impl ImageResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Program each image at its slot in `layout`. A failed image does not undo
/// earlier ones; after a communication fault the rest are not attempted.
pub fn program_layout<R: RegisterBus + ?Sized>(
    bus: &mut R,
    layout: Layout,
    images: Vec<FlashImage<'_>>,
    on_progress: &mut dyn FnMut(ImageKind, u8),
) -> Vec<ImageResult> {
    let mut results = Vec::with_capacity(images.len());
    let mut dead = None;
    for image in images {
        let kind = image.kind;
        let offset = layout.offset(kind);
        let outcome = match (offset, &dead) {
            (_, Some(reason)) => Err(eyre::eyre!("not attempted: {reason}")),
            (None, None) => Err(eyre::eyre!("no {kind} slot in the {layout:?} layout")),
            (Some(offset), None) => {
                program_flash(bus, image.reader, image.size, offset, &mut |p| {
                    on_progress(kind, p)
                })
            }
        };
        results.push(match outcome {
            Ok(bytes) => ImageResult {
                image: kind.to_string(),
                offset,
                bytes,
                error: None,
            },
            Err(e) => {
                warn!(image = %kind, "flash failed: {e:#}");
                if dead.is_none() && e.fault_kind() == Some(FaultKind::Communication) {
                    dead = Some(format!("{e}"));
                }
                ImageResult {
                    image: kind.to_string(),
                    offset,
                    bytes: 0,
                    error: Some(format!("{e:#}")),
                }
            }
        });
    }
    results
}

/// Where [`program_image`] sends an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Straight into the FPGA configuration memory.
    Configuration,
    Flash { offset: u32 },
}

/// Configure the FPGA from `image`, or write it to flash through the running
/// design. Progress is reported in percent either way.
pub fn program_image<B: Backend>(
    session: &mut Session<B>,
    profile: Profile,
    destination: Destination,
    image: &mut dyn Read,
    size: usize,
    on_progress: &mut dyn FnMut(u8),
) -> Result<usize> {
    match destination {
        Destination::Configuration => {
            let mut sent = 0;
            profile.load_configuration(session, image, &mut |n| {
                sent = n;
                on_progress(percent(n, size));
            })?;
            Ok(sent)
        }
        Destination::Flash { offset } => {
            let mut bus = UserBus::new(session, profile);
            program_flash(&mut bus, image, size, offset, on_progress)
        }
    }
}
