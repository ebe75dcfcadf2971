use std::{fmt::Display, process::ExitCode};

use cartprobe_harness::RegisterBus;
use cartprobe_io::{FaultExt, FaultKind};
use color_eyre::eyre::{Result, WrapErr, eyre};
use facet::Facet;
use facet_pretty::FacetPretty;
use tracing::Span;

/// Decimal or `0x` prefixed hexadecimal.
pub fn parse_u32(s: &str) -> Result<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    }
    .wrap_err_with(|| format!("bad number {s:?}"))
}

/// Serializer output, whether or not the format can fail.
pub trait Rendered {
    fn rendered(self) -> Result<String>;
}

impl Rendered for String {
    fn rendered(self) -> Result<String> {
        Ok(self)
    }
}

impl<E: Display> Rendered for std::result::Result<String, E> {
    fn rendered(self) -> Result<String> {
        self.map_err(|e| eyre!("serializing report: {e}"))
    }
}

pub fn report<'a, T: Facet<'a>>(value: &'a T, json: bool) -> Result<()> {
    if json {
        println!("{}", facet_json::to_string(value).rendered()?);
    } else {
        println!("{}", value.pretty());
    }
    Ok(())
}

/// Communication 3, critical 2, anything else 1.
pub fn exit_code(err: &color_eyre::Report) -> ExitCode {
    match err.fault_kind() {
        Some(FaultKind::Communication) => ExitCode::from(3),
        Some(FaultKind::Critical) => ExitCode::from(2),
        Some(FaultKind::Recoverable) | None => ExitCode::from(1),
    }
}

pub enum Unit {
    Bytes,
    Percent,
}

pub fn progress_bar(enabled: bool, len: u64, unit: Unit) -> Option<indicatif::ProgressBar> {
    if !enabled {
        return None;
    }
    let (template, len) = match unit {
        Unit::Bytes => (
            "{spinner:.green} {elapsed:>3}/{duration:>3} {bar} {bytes}/{total_bytes} ({bytes_per_sec})",
            len,
        ),
        Unit::Percent => ("{spinner:.green} {elapsed:>3} {bar} {pos:>3}% {msg}", 100),
    };
    let style = indicatif::ProgressStyle::with_template(template).ok()?;
    let pb = indicatif::ProgressBar::new(len)
        .with_finish(indicatif::ProgressFinish::Abandon)
        .with_style(style);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Some(pb)
}

/// Runs every bus access inside `span`, so log lines from two boards can be
/// told apart.
pub struct Spanned<R> {
    pub bus: R,
    pub span: Span,
}

impl<R: RegisterBus> RegisterBus for Spanned<R> {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let _e = self.span.enter();
        self.bus.write_memory(address, data)
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let _e = self.span.enter();
        self.bus.read_memory(address, len)
    }

    fn read_fifo(&mut self, max: usize, channel: u8, stop_on_empty: bool) -> Result<Vec<u8>> {
        let _e = self.span.enter();
        self.bus.read_fifo(max, channel, stop_on_empty)
    }

    fn write_io(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let _e = self.span.enter();
        self.bus.write_io(address, data)
    }

    fn read_io(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let _e = self.span.enter();
        self.bus.read_io(address, len)
    }

    fn set_outputs(&mut self, value: u8) -> Result<()> {
        let _e = self.span.enter();
        self.bus.set_outputs(value)
    }
}

#[cfg(test)]
mod tests {
    use cartprobe_io::Fault;

    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_u32("0x10_0300").unwrap(), 0x10_0300);
        assert_eq!(parse_u32("4096").unwrap(), 4096);
        assert!(parse_u32("0xZZ").is_err());
    }

    #[test]
    fn exit_codes() {
        let code = |e: color_eyre::Report| format!("{:?}", exit_code(&e));
        assert_eq!(code(Fault::communication("x").into()), format!("{:?}", ExitCode::from(3)));
        assert_eq!(code(Fault::critical("x").into()), format!("{:?}", ExitCode::from(2)));
        assert_eq!(code(eyre!("usage")), format!("{:?}", ExitCode::from(1)));
    }
}
