use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
    process::ExitCode,
};

use cartprobe_fpga::{Family, Profile, RegisterBus, UserBus, lattice, xilinx::bitfile};
use cartprobe_harness::{
    board::{self, Console},
    continuity, ddr2,
    flash::{self, Destination, FlashImage, ImageKind, Layout},
};
use cartprobe_io::{
    Fault, Session, SpaceHex,
    cables::{Connection, DEFAULT_FREQUENCY},
    ftdi,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, bail},
};
use tracing::{info, info_span};

use crate::cli_helpers::{Spanned, Unit, exit_code, parse_u32, progress_bar, report};

mod cli_helpers;

#[derive(clap::Parser)]
#[command(version, about = "JTAG factory test and programming harness")]
struct Args {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Args)]
struct GlobalOpts {
    /// Adapter of the device under test
    #[arg(long, default_value = "ftdi://ftdi:2232h/1", global = true)]
    adapter: Connection,

    /// Adapter of the tester board
    #[arg(long, default_value = "ftdi://ftdi:2232h/2", global = true)]
    tester: Connection,

    /// TCK frequency in Hz
    #[arg(long, default_value_t = DEFAULT_FREQUENCY, global = true)]
    frequency: u32,

    /// FPGA family of the device under test
    #[arg(long, value_enum, default_value_t = Family::Lattice, global = true)]
    family: Family,

    /// FPGA family of the tester board
    #[arg(long, value_enum, default_value_t = Family::Xilinx, global = true)]
    tester_family: Family,

    /// ID code to expect instead of the family default
    #[arg(long, value_parser = parse_u32, global = true)]
    expected_id: Option<u32>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable the progress bar
    #[arg(long, global = true)]
    no_progress_bar: bool,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Read and check the JTAG ID code
    Id,
    /// Configuration status register
    Status,
    /// ECP5 factory trace ID
    TraceId,
    /// Configure the FPGA over JTAG
    Load { bitstream: PathBuf },
    /// Write a raw image to flash at `offset` through the running design
    Program {
        image: PathBuf,
        #[arg(long, value_parser = parse_u32, default_value = "0")]
        offset: u32,
    },
    /// Check the design's user register ID
    UserId,
    /// Drain a console FIFO
    Console {
        #[arg(long)]
        secondary: bool,
    },
    ReadMem {
        #[arg(value_parser = parse_u32)]
        address: u32,
        len: usize,
    },
    WriteMem {
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Bytes as hex
        data: String,
    },
    /// Copy a program into memory
    Upload {
        image: PathBuf,
        #[arg(value_parser = parse_u32)]
        address: u32,
        /// Start it through the boot loader afterwards
        #[arg(long)]
        run: bool,
    },
    /// Program images into the board's SPI flash
    Flash(FlashArgs),
    /// Initialise DDR2 and calibrate the DQS read delay
    Calibrate {
        #[arg(long)]
        invert_dqs: bool,
    },
    /// Address line test of the main memory
    MemTest {
        #[arg(long, default_value_t = 0x1541)]
        seed: u64,
    },
    /// Measure the reference and oscillator clocks
    Clocks,
    /// Board revision and flash unique ID
    BoardInfo,
    /// Walking-bit test between tester and DUT
    Continuity {
        #[arg(long, value_enum)]
        port: Option<Port>,
    },
}

#[derive(clap::Args)]
struct FlashArgs {
    #[arg(long)]
    fpga: Option<PathBuf>,
    #[arg(long)]
    app: Option<PathBuf>,
    #[arg(long)]
    fs: Option<PathBuf>,
    /// Use the tester board's flash map
    #[arg(long)]
    tester: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Port {
    Bottom,
    Top,
    Cassette,
}

fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("{e:?}");
        return ExitCode::FAILURE;
    }
    let Args { global, command } = Args::parse();
    match run(command, &global) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            exit_code(&e)
        }
    }
}

type DeviceSession = Session<ftdi::Device>;

fn open(connection: &Connection, frequency: u32) -> Result<DeviceSession> {
    Ok(Session::new(connection.open(frequency)?)?)
}

fn profile(family: Family, expected_id: Option<u32>) -> Profile {
    let profile = Profile::new(family);
    match expected_id {
        Some(id) => profile.with_expected_id(id),
        None => profile,
    }
}

fn open_image(path: &Path) -> Result<(BufReader<File>, usize)> {
    let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
    let size = file.metadata()?.len() as usize;
    Ok((BufReader::new(file), size))
}

fn run(command: CliCommand, global: &GlobalOpts) -> Result<()> {
    let span = info_span!("dut");
    let profile = profile(global.family, global.expected_id);
    let mut session = span.in_scope(|| open(&global.adapter, global.frequency))?;
    let progress = !global.no_progress_bar;

    if let CliCommand::Continuity { port } = command {
        return run_continuity(port, global, &mut session, profile, span);
    }
    let _e = span.enter();

    match command {
        CliCommand::Continuity { .. } => {}
        CliCommand::Id => {
            let id = profile.identify(&mut session)?;
            println!("{id:08X}");
        }
        CliCommand::Status => {
            let status = profile.read_status(&mut session)?;
            println!("{status:08X}");
        }
        CliCommand::TraceId => {
            if profile.family() != Family::Lattice {
                bail!("trace ID is only available on {}", Family::Lattice);
            }
            profile.identify(&mut session)?;
            report(&lattice::read_trace_id(&mut session)?, global.json)?;
        }
        CliCommand::Load { bitstream } => load(&mut session, profile, &bitstream, progress)?,
        CliCommand::Program { image, offset } => {
            let (mut reader, size) = open_image(&image)?;
            let pb = progress_bar(progress, 100, Unit::Percent);
            UserBus::new(&mut session, profile).check_user_id()?;
            let written = flash::program_image(
                &mut session,
                profile,
                Destination::Flash { offset },
                &mut reader,
                size,
                &mut |p| {
                    if let Some(pb) = &pb {
                        pb.set_position(p.into())
                    }
                },
            )?;
            println!("{written} bytes at {offset:#X}");
        }
        CliCommand::UserId => {
            let mut bus = UserBus::new(&mut session, profile);
            bus.check_user_id()?;
            println!("{:08X}", bus.read_user_id()?);
        }
        CliCommand::Console { secondary } => {
            let console = match secondary {
                true => Console::Secondary,
                false => Console::Primary,
            };
            let mut bus = UserBus::new(&mut session, profile);
            print!("{}", board::read_console(&mut bus, console)?);
        }
        CliCommand::ReadMem { address, len } => {
            let data = UserBus::new(&mut session, profile).read_memory(address, len)?;
            for (i, row) in data.chunks(16).enumerate() {
                println!("{:08X}: {}", address as usize + i * 16, SpaceHex(row));
            }
        }
        CliCommand::WriteMem { address, data } => {
            let data = hex::decode(data.replace(' ', "")).wrap_err("bad hex data")?;
            UserBus::new(&mut session, profile).write_memory(address, &data)?;
        }
        CliCommand::Upload {
            image,
            address,
            run,
        } => {
            let (mut reader, size) = open_image(&image)?;
            let pb = progress_bar(progress, size as u64, Unit::Bytes);
            let mut bus = UserBus::new(&mut session, profile);
            board::upload(&mut bus, &mut reader, address, &mut |n| {
                if let Some(pb) = &pb {
                    pb.set_position(n as u64)
                }
            })?;
            if run {
                board::run_app(&mut bus, address, true)?;
                info!(address = format_args!("{address:#X}"), "started");
            }
        }
        CliCommand::Flash(args) => flash(&mut session, profile, args, global)?,
        CliCommand::Calibrate { invert_dqs } => {
            let mut bus = UserBus::new(&mut session, profile);
            ddr2::initialize(&mut bus, invert_dqs)?;
            let cal = ddr2::calibrate(&mut bus)?;
            report(&cal, global.json)?;
            cal.into_result()?;
        }
        CliCommand::MemTest { seed } => {
            board::memory_test(&mut UserBus::new(&mut session, profile), seed)?;
        }
        CliCommand::Clocks => {
            let clocks = board::measure_clocks(&mut UserBus::new(&mut session, profile))?;
            report(&clocks, global.json)?;
            clocks.into_result()?;
        }
        CliCommand::BoardInfo => {
            let info = board::board_info(&mut UserBus::new(&mut session, profile))?;
            report(&info, global.json)?;
        }
    }
    Ok(())
}

fn load(session: &mut DeviceSession, profile: Profile, path: &Path, progress: bool) -> Result<()> {
    profile.identify(session)?;
    let mut data = Vec::new();
    File::open(path)
        .and_then(|mut f| f.read_to_end(&mut data))
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let image = match profile.family() {
        Family::Xilinx => {
            if let Ok(file) = bitfile::Bitfile::parse(&data) {
                info!(design = file.design, part = file.part, date = file.date, time = file.time, "bitstream");
            }
            bitfile::payload(&data)?
        }
        Family::Lattice => &data[..],
    };
    let pb = progress_bar(progress, 100, Unit::Percent);
    flash::program_image(
        session,
        profile,
        Destination::Configuration,
        &mut &image[..],
        image.len(),
        &mut |p| {
            if let Some(pb) = &pb {
                pb.set_position(p.into())
            }
        },
    )?;
    println!("configured, status {:08X}", profile.read_status(session)?);
    Ok(())
}

fn flash(
    session: &mut DeviceSession,
    profile: Profile,
    args: FlashArgs,
    global: &GlobalOpts,
) -> Result<()> {
    let layout = match args.tester {
        true => Layout::Tester,
        false => Layout::Dut,
    };
    let mut opened = Vec::new();
    for (kind, path) in [
        (ImageKind::Fpga, args.fpga),
        (ImageKind::Application, args.app),
        (ImageKind::Filesystem, args.fs),
    ] {
        if let Some(path) = path {
            let (reader, size) = open_image(&path)?;
            opened.push((kind, reader, size));
        }
    }
    if opened.is_empty() {
        bail!("nothing to flash, pass --fpga, --app or --fs");
    }
    let images = opened
        .iter_mut()
        .map(|(kind, reader, size)| FlashImage {
            kind: *kind,
            reader,
            size: *size,
        })
        .collect();

    let pb = progress_bar(!global.no_progress_bar, 100, Unit::Percent);
    let mut bus = UserBus::new(session, profile);
    bus.check_user_id()?;
    let results = flash::program_layout(&mut bus, layout, images, &mut |kind, percent| {
        if let Some(pb) = &pb {
            pb.set_message(kind.to_string());
            pb.set_position(percent.into());
        }
    });
    report(&results, global.json)?;
    let failed: Vec<_> = results.iter().filter(|r| !r.is_ok()).map(|r| &r.image[..]).collect();
    if !failed.is_empty() {
        return Err(Fault::critical(format!("flashing failed: {}", failed.join(", "))).into());
    }
    Ok(())
}

fn run_continuity(
    port: Option<Port>,
    global: &GlobalOpts,
    dut_session: &mut DeviceSession,
    dut_profile: Profile,
    dut_span: tracing::Span,
) -> Result<()> {
    let tester_span = info_span!("tester");
    let mut tester_session =
        tester_span.in_scope(|| open(&global.tester, global.frequency))?;
    let mut dut = Spanned {
        bus: UserBus::new(dut_session, dut_profile),
        span: dut_span,
    };
    let mut tester = Spanned {
        bus: UserBus::new(&mut tester_session, Profile::new(global.tester_family)),
        span: tester_span,
    };
    dut.span.in_scope(|| dut.bus.check_user_id())?;
    tester.span.in_scope(|| tester.bus.check_user_id())?;

    let ports = match port {
        Some(port) => vec![port],
        None => vec![Port::Bottom, Port::Top, Port::Cassette],
    };
    let mut checks = Vec::with_capacity(ports.len());
    for port in ports {
        checks.push(match port {
            Port::Bottom => continuity::check_bottom_row(&mut tester, &mut dut)?,
            Port::Top => continuity::check_top_row(&mut tester, &mut dut)?,
            Port::Cassette => continuity::check_cassette(&mut tester, &mut dut)?,
        });
    }
    report(&checks, global.json)?;
    for check in checks {
        check.into_result()?;
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .with(tracing_error::ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}
