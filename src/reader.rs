//! Device readers: where raw register values come from.
//!
//! The decoding core only ever asks a [`Reader`] for "the value of `width`
//! bits at bus address `addr`". Three implementations cover the probing
//! setups the tool supports:
//!
//! * [`ValueReader`] - emulated device returning one fixed value, for
//!   decoding a literal register value from the command line,
//! * [`MemReader`] - a lazily re-mapped read-only window into `/dev/mem`
//!   (or any file), for memory-mapped SoC peripherals,
//! * [`I2cReader`] - register reads over a Linux I2C character device.
//!
//! Readers may block; callers own any scheduling concerns. Each read also
//! receives the bus parameters of the unit being walked so that a
//! definitions stream can prescribe address/data byte order per hardware
//! block; `Native` defers to the reader's own configuration.

use crate::defs::{Endian, EndianDescriptor, Unit};
use crate::error::{self, ErrorKind};
use crate::regval::RegValue;

use embedded_hal::blocking::i2c::WriteRead;
use failure::ResultExt;
use linux_embedded_hal::I2cdev;
use log::{debug, warn};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::{sysconf, SysconfVar};

use std::fs::File;
use std::os::raw::c_void;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Bus parameters a unit prescribes for its reader. An `addr_width` of 0
/// and `Native` endian nibbles leave the respective choice to the reader.
#[derive(Debug, Clone, Copy)]
pub struct UnitBus {
    pub addr_width: u8,
    pub endian: EndianDescriptor,
}

impl UnitBus {
    pub fn of(unit: &Unit<'_>) -> Self {
        Self {
            addr_width: unit.addr_width,
            endian: unit.endian,
        }
    }
}

impl Default for UnitBus {
    fn default() -> Self {
        Self {
            addr_width: 0,
            endian: EndianDescriptor::default(),
        }
    }
}

/// The external read capability
pub trait Reader {
    /// Read the `width`-bit register at absolute bus address `addr`
    fn read(&mut self, addr: u64, width: usize, bus: &UnitBus) -> error::Result<RegValue>;
}

fn host_endian() -> Endian {
    if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    }
}

/// Unit choice first, reader default second, host order last
fn resolve_endian(unit: Endian, default: Endian) -> Endian {
    match (unit, default) {
        (Endian::Native, Endian::Native) => host_endian(),
        (Endian::Native, e) => e,
        (e, _) => e,
    }
}

/// Build a register value from device bytes in the given byte order
fn regval_from_bus(width: usize, data: &[u8], endian: Endian) -> RegValue {
    let v = RegValue::from_le_bytes(width, data);
    match endian {
        Endian::Big => v.reverse_bytes(),
        _ => v,
    }
}

/// Emulated device: every read returns the same literal value
pub struct ValueReader {
    value: u64,
}

impl ValueReader {
    pub fn new(value: u64) -> Self {
        Self { value }
    }
}

impl Reader for ValueReader {
    fn read(&mut self, _addr: u64, width: usize, _bus: &UnitBus) -> error::Result<RegValue> {
        Ok(RegValue::from_u64(width, self.value))
    }
}

#[derive(Debug)]
struct Mapping {
    ptr: *mut c_void,
    len: usize,
    /// File offset the window starts at (page aligned)
    start: u64,
}

impl Mapping {
    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.start && addr + len as u64 <= self.start + self.len as u64
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("munmap of register window failed: {}", e);
        }
    }
}

/// Read-only window into a memory-mapped device, usually `/dev/mem`.
///
/// Pages are mapped on demand and remapped whenever a read falls outside
/// the current window, the same way one would walk a register file with
/// a moving `mmap`.
#[derive(Debug)]
pub struct MemReader {
    file: File,
    page_size: u64,
    map: Option<Mapping>,
    default_endian: EndianDescriptor,
}

impl MemReader {
    pub fn open<P: AsRef<Path>>(path: P, default_endian: EndianDescriptor) -> error::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| ErrorKind::Mem(format!("cannot open '{}': {}", path.display(), e)))?;

        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .ok_or_else(|| ErrorKind::Mem("cannot determine page size".to_string()))?
            as u64;

        debug!(
            "memory device '{}' open, page size {}",
            path.display(),
            page_size
        );

        Ok(Self {
            file,
            page_size,
            map: None,
            default_endian,
        })
    }

    fn window(&mut self, addr: u64, len: usize) -> error::Result<&Mapping> {
        let need_remap = match &self.map {
            Some(m) => !m.covers(addr, len),
            None => true,
        };

        if need_remap {
            // drop the old window before mapping the next one
            self.map = None;

            let start = addr & !(self.page_size - 1);
            let map_len = (addr + len as u64 - start + self.page_size - 1)
                & !(self.page_size - 1);

            let ptr = unsafe {
                mmap(
                    std::ptr::null_mut(),
                    map_len as usize,
                    ProtFlags::PROT_READ,
                    MapFlags::MAP_SHARED,
                    self.file.as_raw_fd(),
                    start as i64,
                )
            }
            .map_err(|e| ErrorKind::Mem(format!("mmap at {:#x} failed: {}", start, e)))?;

            self.map = Some(Mapping {
                ptr,
                len: map_len as usize,
                start,
            });
        }

        Ok(self.map.as_ref().expect("window just mapped"))
    }
}

impl Reader for MemReader {
    fn read(&mut self, addr: u64, width: usize, bus: &UnitBus) -> error::Result<RegValue> {
        let len = width / 8;
        let endian = resolve_endian(bus.endian.data, self.default_endian.data);

        let window = self.window(addr, len)?;
        let off = (addr - window.start) as usize;
        let data = unsafe { std::slice::from_raw_parts(window.ptr.cast::<u8>().add(off), len) };

        Ok(regval_from_bus(width, data, endian))
    }
}

/// Register reads over a Linux I2C bus device.
///
/// A read is one write-then-read transfer: the register address goes out
/// in `addr_width / 8` bytes, the device answers with `width / 8` data
/// bytes. Byte order of both phases follows the unit's descriptor, with
/// the configured default filling in.
pub struct I2cReader {
    dev: I2cdev,
    i2c_addr: u8,
    addr_width: u8,
    default_endian: EndianDescriptor,
}

impl I2cReader {
    pub fn open<P: AsRef<Path>>(
        path: P,
        i2c_addr: u8,
        addr_width: u8,
        default_endian: EndianDescriptor,
    ) -> error::Result<Self> {
        let path = path.as_ref();
        check_addr_width(addr_width)?;
        if i2c_addr > 0x7f {
            Err(ErrorKind::I2c(format!(
                "I2C address {:#x} does not fit 7 bits",
                i2c_addr
            )))?
        }

        let dev = I2cdev::new(path).with_context(|e| ErrorKind::I2c(e.to_string()))?;
        debug!(
            "I2C device '{}' open, slave address {:#x}",
            path.display(),
            i2c_addr
        );

        Ok(Self {
            dev,
            i2c_addr,
            addr_width,
            default_endian,
        })
    }
}

fn check_addr_width(addr_width: u8) -> error::Result<()> {
    match addr_width {
        8 | 16 | 32 => Ok(()),
        other => Err(ErrorKind::I2c(format!(
            "unsupported address width {} bits",
            other
        )))?,
    }
}

/// Serialize a bus address into its wire bytes
fn addr_bytes(addr: u64, addr_width: u8, endian: Endian) -> error::Result<Vec<u8>> {
    let n = usize::from(addr_width / 8);
    if addr >> u64::from(addr_width) != 0 {
        Err(ErrorKind::I2c(format!(
            "register address {:#x} does not fit {} bits",
            addr, addr_width
        )))?
    }

    let le = addr.to_le_bytes();
    let mut bytes = le[..n].to_vec();
    if endian == Endian::Big || (endian == Endian::Native && cfg!(target_endian = "big")) {
        bytes.reverse();
    }
    Ok(bytes)
}

impl Reader for I2cReader {
    fn read(&mut self, addr: u64, width: usize, bus: &UnitBus) -> error::Result<RegValue> {
        let addr_width = if bus.addr_width != 0 {
            bus.addr_width
        } else {
            self.addr_width
        };
        check_addr_width(addr_width)?;

        let out = addr_bytes(
            addr,
            addr_width,
            resolve_endian(bus.endian.addr, self.default_endian.addr),
        )?;

        let mut data = vec![0u8; width / 8];
        self.dev
            .write_read(self.i2c_addr, &out, &mut data)
            .with_context(|e| ErrorKind::I2c(e.to_string()))?;

        Ok(regval_from_bus(
            width,
            &data,
            resolve_endian(bus.endian.data, self.default_endian.data),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_value_reader() {
        let mut r = ValueReader::new(0xdead_beef);
        let bus = UnitBus::default();

        let v = r.read(0x1000, 32, &bus).unwrap();
        assert_eq!(v.to_u64(), 0xdead_beef);

        // width drives truncation/extension, the address is irrelevant
        assert_eq!(r.read(0, 8, &bus).unwrap().to_u64(), 0xef);
        assert_eq!(r.read(0, 128, &bus).unwrap().to_u64(), 0xdead_beef);
    }

    #[test]
    fn test_resolve_endian() {
        assert_eq!(resolve_endian(Endian::Big, Endian::Little), Endian::Big);
        assert_eq!(resolve_endian(Endian::Native, Endian::Little), Endian::Little);
        assert_eq!(
            resolve_endian(Endian::Native, Endian::Native),
            host_endian()
        );
    }

    #[test]
    fn test_addr_bytes() {
        assert_eq!(
            addr_bytes(0x1234, 16, Endian::Big).unwrap(),
            vec![0x12, 0x34]
        );
        assert_eq!(
            addr_bytes(0x1234, 16, Endian::Little).unwrap(),
            vec![0x34, 0x12]
        );
        assert_eq!(addr_bytes(0xab, 8, Endian::Big).unwrap(), vec![0xab]);
        assert!(addr_bytes(0x1234, 8, Endian::Big).is_err());
    }

    #[test]
    fn test_i2c_addr_width_validation() {
        assert!(check_addr_width(16).is_ok());
        match check_addr_width(12).unwrap_err().kind() {
            ErrorKind::I2c(_) => (),
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    /// Pattern file standing in for a memory-mapped device
    fn pattern_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..128 * 1024u32).map(|i| i as u8).collect();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_mem_reader() {
        let f = pattern_file();
        let mut r = MemReader::open(f.path(), EndianDescriptor::default()).unwrap();
        let bus = UnitBus::default();

        let v = r.read(0x10, 32, &bus).unwrap();
        assert_eq!(v.as_bytes(), [0x10, 0x11, 0x12, 0x13]);

        // remap far away from the first window
        let v = r.read(0x11170, 16, &bus).unwrap();
        assert_eq!(v.as_bytes(), [0x70, 0x71]);

        // and back again
        let v = r.read(0x0, 8, &bus).unwrap();
        assert_eq!(v.to_u64(), 0x00);
    }

    #[test]
    fn test_mem_reader_data_endian() {
        let f = pattern_file();
        let mut r = MemReader::open(f.path(), EndianDescriptor::default()).unwrap();

        let big = UnitBus {
            addr_width: 0,
            endian: EndianDescriptor::new(Endian::Native, Endian::Big),
        };
        let v = r.read(0x20, 32, &big).unwrap();
        assert_eq!(v.to_u64(), 0x2021_2223);

        let little = UnitBus {
            addr_width: 0,
            endian: EndianDescriptor::new(Endian::Native, Endian::Little),
        };
        let v = r.read(0x20, 32, &little).unwrap();
        assert_eq!(v.to_u64(), 0x2322_2120);
    }

    #[test]
    fn test_mem_reader_missing_device() {
        let res = MemReader::open("/nonexistent/device", EndianDescriptor::default());
        match res.unwrap_err().kind() {
            ErrorKind::Mem(_) => (),
            other => panic!("unexpected error kind {:?}", other),
        }
    }
}
