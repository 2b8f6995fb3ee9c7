use clap::{ArgEnum, Parser};
use failure::ResultExt;
use log::{info, warn, LevelFilter};

use regdecode::decode::{self, Sink};
use regdecode::defs::{self, Endian, EndianDescriptor};
use regdecode::error::{self, ErrorKind};
use regdecode::reader::{I2cReader, MemReader, Reader, UnitBus, ValueReader};
use regdecode::render::TextRenderer;

use std::fs;
use std::io;
use std::path::PathBuf;

#[derive(ArgEnum, Clone, Copy, Debug, PartialEq)]
enum DevType {
    /// Emulated device returning the value given with --value
    Emu,
    /// Linux I2C character device
    I2c,
    /// Memory-mapped window, /dev/mem by default
    Mem,
}

#[derive(ArgEnum, Clone, Copy, Debug)]
enum CliEndian {
    Little,
    Big,
}

impl From<CliEndian> for Endian {
    fn from(e: CliEndian) -> Self {
        match e {
            CliEndian::Little => Endian::Little,
            CliEndian::Big => Endian::Big,
        }
    }
}

/// Decode CPU/SoC registers using a binary definitions stream
#[derive(Parser, Debug)]
#[clap(name = "regdecode", version, about)]
struct Opt {
    /// Device used to read raw register values
    #[clap(short = 'T', long = "type", arg_enum, value_name = "TYPE")]
    dev_type: DevType,

    /// File carrying the serialized register definitions
    #[clap(short = 'd', long, value_name = "FILE")]
    definitions: PathBuf,

    /// Bus device path (e.g. /dev/i2c-2 or /dev/mem)
    #[clap(short = 'D', long = "bus-device", value_name = "DEV")]
    bus_device: Option<PathBuf>,

    /// I2C slave address
    #[clap(short = 'A', long = "bus-addr", parse(try_from_str = parse_int), value_name = "ADDR")]
    bus_addr: Option<u64>,

    /// Width in bits of the bus address phase (8, 16 or 32)
    #[clap(short = 'W', long = "addr-width", value_name = "BITS")]
    addr_width: Option<u8>,

    /// Default device byte order; units may override it
    #[clap(short = 'E', long, arg_enum, value_name = "ENDIAN")]
    endian: Option<CliEndian>,

    /// Literal register value for the emulated device
    #[clap(short = 'v', long, parse(try_from_str = parse_int), value_name = "VALUE")]
    value: Option<u64>,

    /// Raise log verbosity (repeat for more detail)
    #[clap(long, parse(from_occurrences))]
    verbose: u64,

    /// First address to decode; '?ADDR' decodes exactly one register,
    /// taking its raw value from --value
    #[clap(value_name = "START")]
    start: Option<String>,

    /// Last address to decode (inclusive, defaults to START)
    #[clap(value_name = "END")]
    end: Option<String>,
}

impl Opt {
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Byte order the devices fall back to when the unit says "native"
    fn default_endian(&self) -> EndianDescriptor {
        let e = match (self.endian, self.dev_type) {
            (Some(e), _) => Endian::from(e),
            // I2C devices traditionally answer most-significant byte first
            (None, DevType::I2c) => Endian::Big,
            (None, _) => Endian::Native,
        };
        EndianDescriptor::new(e, e)
    }
}

/// Accept plain decimal or 0x-prefixed hexadecimal
fn parse_int(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn open_device(opt: &Opt) -> error::Result<Box<dyn Reader>> {
    let endian = opt.default_endian();

    Ok(match opt.dev_type {
        DevType::Emu => {
            let value = opt
                .value
                .ok_or_else(|| ErrorKind::General("missing --value".to_string()))?;
            Box::new(ValueReader::new(value))
        }

        DevType::Mem => {
            let path = opt
                .bus_device
                .clone()
                .unwrap_or_else(|| PathBuf::from("/dev/mem"));
            Box::new(MemReader::open(path, endian)?)
        }

        DevType::I2c => {
            let path = opt
                .bus_device
                .as_ref()
                .ok_or_else(|| ErrorKind::General("missing --bus-device".to_string()))?;
            let addr = opt
                .bus_addr
                .ok_or_else(|| ErrorKind::General("missing --bus-addr".to_string()))?;
            let addr = u8::try_from(addr).map_err(|_| {
                ErrorKind::I2c(format!("I2C address {:#x} does not fit 7 bits", addr))
            })?;
            let addr_width = opt
                .addr_width
                .ok_or_else(|| ErrorKind::General("missing --addr-width".to_string()))?;
            Box::new(I2cReader::open(path, addr, addr_width, endian)?)
        }
    })
}

fn run(opt: &Opt) -> error::Result<()> {
    let data = fs::read(&opt.definitions).with_context(|e| {
        ErrorKind::Io(format!(
            "cannot read definitions from '{}': {}",
            opt.definitions.display(),
            e
        ))
    })?;

    let (units, rest) = defs::parse_units(&data)?;
    if !rest.is_empty() {
        warn!(
            "{} trailing bytes in '{}'",
            rest.len(),
            opt.definitions.display()
        );
    }

    // Address range; a bare start address narrows the walk to one address,
    // '?' additionally replaces the device by the literal --value.
    let mut start = 0;
    let mut end = u64::MAX;
    let mut single = false;

    if let Some(arg) = &opt.start {
        let arg = match arg.strip_prefix('?') {
            Some(rest) => {
                single = true;
                rest
            }
            None => arg.as_str(),
        };
        start = parse_int(arg)
            .map_err(|_| ErrorKind::General(format!("invalid start address '{}'", arg)))?;
        end = start;
    }

    if let Some(arg) = &opt.end {
        if single {
            Err(ErrorKind::General(
                "an end address cannot be combined with '?'".to_string(),
            ))?
        }
        end = parse_int(arg)
            .map_err(|_| ErrorKind::General(format!("invalid end address '{}'", arg)))?;
    }

    let mut device: Box<dyn Reader> = if single {
        let value = opt
            .value
            .ok_or_else(|| ErrorKind::General("'?' decoding needs --value".to_string()))?;
        Box::new(ValueReader::new(value))
    } else {
        open_device(opt)?
    };

    let stdout = io::stdout();
    let mut renderer = TextRenderer::new(stdout.lock());

    let visited = defs::walk_range(&units, start, end, |unit, reg| {
        let raw = device.read(reg.abs_addr(unit), reg.width, &UnitBus::of(unit))?;
        renderer.begin_register(unit, reg, &raw)?;
        decode::decode_register(reg, &raw, &mut renderer)?;
        renderer.end_register(unit, reg)
    })?;

    if visited == 0 {
        Err(ErrorKind::General(
            "no registers in the requested address range".to_string(),
        ))?
    }

    info!("decoded {} registers", visited);
    Ok(())
}

fn main() -> error::Result<()> {
    let opt = Opt::parse();
    env_logger::builder()
        .filter_level(opt.log_level())
        .parse_default_env()
        .init();

    run(&opt)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("0").unwrap(), 0);
        assert_eq!(parse_int("4096").unwrap(), 4096);
        assert_eq!(parse_int("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_int("0XdeadBEEF").unwrap(), 0xdead_beef);
        assert!(parse_int("0xzz").is_err());
        assert!(parse_int("").is_err());
    }

    #[test]
    fn test_default_endian() {
        let mut opt = Opt::parse_from(["regdecode", "-T", "i2c", "-d", "defs.bin"]);
        assert_eq!(
            opt.default_endian(),
            EndianDescriptor::new(Endian::Big, Endian::Big)
        );

        opt.dev_type = DevType::Mem;
        assert_eq!(opt.default_endian(), EndianDescriptor::default());

        opt.endian = Some(CliEndian::Little);
        assert_eq!(
            opt.default_endian(),
            EndianDescriptor::new(Endian::Little, Endian::Little)
        );
    }
}
