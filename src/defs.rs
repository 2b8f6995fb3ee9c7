//! Register definitions: the unit/register/field tree and its deserializer.
//!
//! A definitions stream describes the register map of a machine as a list
//! of *units* (contiguous address regions), each owning *registers*, each
//! owning *fields* with a decoding rule. The deserializer builds the tree
//! in one pass; `id` and `name` strings borrow directly from the input
//! buffer, so the tree can never outlive the stream it was parsed from.
//!
//! Truncated input surfaces as an error and nothing of the partial tree
//! survives. Conditions that a well-formed stream can never produce
//! (unknown field kinds, impossible widths, overlapping fraction masks)
//! panic instead - they mean the definitions file itself is corrupt.

use crate::error::{self, ErrorKind};
use crate::regval::{self, RegValue};
use crate::stream::Stream;

use log::{debug, warn};
use packed_struct::prelude::*;
use packed_struct_codegen::{PackedStruct, PrimitiveEnum_u8};

/// Field kind tags as they appear on the wire
pub(crate) const KIND_ENUM: u8 = 1;
pub(crate) const KIND_BOOL: u8 = 2;
pub(crate) const KIND_FRAC: u8 = 3;
pub(crate) const KIND_SINT: u8 = 4;
pub(crate) const KIND_UINT: u8 = 5;
pub(crate) const KIND_RESERVED: u8 = 6;

/// Byte order of one side (address or data) of a hardware bus
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    /// Whatever the probing host uses
    Native = 0,
    Little = 1,
    Big = 2,
}

/// How a unit's hardware organizes addresses and data. The decoding core
/// never consumes this; it is carried through to the device readers.
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct EndianDescriptor {
    /// Byte order of the address phase
    #[packed_field(bits = "7:4", ty = "enum")]
    pub addr: Endian,
    /// Byte order of the data phase
    #[packed_field(bits = "3:0", ty = "enum")]
    pub data: Endian,
}

impl EndianDescriptor {
    pub fn new(addr: Endian, data: Endian) -> Self {
        Self { addr, data }
    }
}

impl Default for EndianDescriptor {
    fn default() -> Self {
        Self::new(Endian::Native, Endian::Native)
    }
}

/// Register access rights
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct RegisterFlags {
    #[packed_field(bits = "0")]
    pub read: bool,
    #[packed_field(bits = "1")]
    pub write: bool,
}

impl RegisterFlags {
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// Preferred rendering base of an integer field
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplayHint {
    Dec = 0,
    Hex = 1,
}

/// Field access rights plus the display hint. Unknown display values are
/// kept as raw catch-all and render as decimal.
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct FieldFlags {
    #[packed_field(bits = "0")]
    pub read: bool,
    #[packed_field(bits = "1")]
    pub write: bool,
    #[packed_field(bits = "3:2", ty = "enum")]
    pub display: EnumCatchAll<DisplayHint>,
}

impl FieldFlags {
    pub fn new(read: bool, write: bool, display: DisplayHint) -> Self {
        Self {
            read,
            write,
            display: EnumCatchAll::Enum(display),
        }
    }

    pub fn is_hex(&self) -> bool {
        self.display == EnumCatchAll::Enum(DisplayHint::Hex)
    }
}

impl Default for FieldFlags {
    fn default() -> Self {
        Self::new(true, true, DisplayHint::Dec)
    }
}

/// One contiguous address region of the machine (a hardware block)
#[derive(Debug, Clone, PartialEq)]
pub struct Unit<'a> {
    /// First address of the region
    pub start: u64,
    /// Last address of the region (inclusive)
    pub end: u64,
    pub id: &'a str,
    pub name: &'a str,
    /// Width in bits of the bus address phase; 0 leaves it to the reader
    pub addr_width: u8,
    pub endian: EndianDescriptor,
    pub registers: Vec<Register<'a>>,
}

impl<'a> Unit<'a> {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }
}

/// A word at a fixed offset within a unit
#[derive(Debug, Clone, PartialEq)]
pub struct Register<'a> {
    /// Offset relative to the unit start
    pub offset: u64,
    /// Logical register width in bits
    pub width: usize,
    pub flags: RegisterFlags,
    pub id: &'a str,
    pub name: &'a str,
    pub fields: Vec<Field<'a>>,
}

impl<'a> Register<'a> {
    /// Absolute bus address of this register within `unit`
    pub fn abs_addr(&self, unit: &Unit<'a>) -> u64 {
        unit.start + self.offset
    }
}

/// A sub-bit-range of a register with a decoding rule
#[derive(Debug, Clone, PartialEq)]
pub struct Field<'a> {
    pub flags: FieldFlags,
    pub id: &'a str,
    pub name: &'a str,
    pub kind: FieldKind<'a>,
}

/// The decoding rule of a field. Bitmasks are register-width values whose
/// set bits select the raw bits contributing to the field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind<'a> {
    /// A single flag bit
    Bool { bit: u8 },
    /// Fixed-point fraction: disjoint integer and fractional bitmasks,
    /// valued `int + frac / 2^popcount(frac_part)`
    Frac {
        int_part: RegValue,
        frac_part: RegValue,
    },
    /// Gap-compressed integer, optionally two's-complement signed
    Int { bitmask: RegValue, is_signed: bool },
    /// Gap-compressed index into a list of named values
    Enum {
        bitmask: RegValue,
        values: Vec<EnumValue<'a>>,
    },
    /// Carries no value; kept so the map documents every bit
    Reserved { bitmask: RegValue },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue<'a> {
    pub value: u32,
    pub name: &'a str,
}

/// Deserialize a definitions stream.
///
/// On success returns the units in stream order together with the
/// unconsumed tail of the buffer. Any failure aborts the whole parse;
/// no partially built tree is observable.
pub fn parse_units(buf: &[u8]) -> error::Result<(Vec<Unit<'_>>, &[u8])> {
    let mut s = Stream::new(buf);

    let num_units = usize::from(s.pop_u16()?);
    let mut units = Vec::with_capacity(num_units);
    for _ in 0..num_units {
        units.push(pop_unit(&mut s)?);
    }

    debug!(
        "parsed {} units ({} bytes left over)",
        units.len(),
        s.remaining()
    );

    Ok((units, s.rest()))
}

fn pop_unit<'a>(s: &mut Stream<'a>) -> error::Result<Unit<'a>> {
    let start = u64::from(s.pop_u32()?);
    let end = u64::from(s.pop_u32()?);
    let id = s.pop_str()?;
    let name = s.pop_str()?;
    let addr_width = s.pop_u8()?;
    let endian = EndianDescriptor::unpack(&[s.pop_u8()?])
        .map_err(|e| ErrorKind::Defs(format!("unit '{}': bad endian descriptor: {}", id, e)))?;

    let num_regs = usize::from(s.pop_u16()?);
    let mut registers = Vec::with_capacity(num_regs);
    for _ in 0..num_regs {
        registers.push(pop_register(s)?);
    }

    if end < start {
        warn!("unit '{}' has an inverted address range", id);
    } else {
        for reg in &registers {
            if reg.offset + (reg.width as u64 / 8) - 1 > end - start {
                warn!("register '{}' extends past the end of unit '{}'", reg.id, id);
            }
        }
    }

    Ok(Unit {
        start,
        end,
        id,
        name,
        addr_width,
        endian,
        registers,
    })
}

fn pop_register<'a>(s: &mut Stream<'a>) -> error::Result<Register<'a>> {
    let offset = u64::from(s.pop_u32()?);
    let width = usize::from(s.pop_u8()?);
    regval::assert_width(width);

    let flags = RegisterFlags::unpack(&[s.pop_uint_var(2)? as u8])
        .map_err(|e| ErrorKind::Defs(format!("bad register flags: {}", e)))?;
    let id = s.pop_str()?;
    let name = s.pop_str()?;

    let num_fields = usize::from(s.pop_u16()?);
    let mut fields = Vec::with_capacity(num_fields);
    for _ in 0..num_fields {
        fields.push(pop_field(s, width)?);
    }

    Ok(Register {
        offset,
        width,
        flags,
        id,
        name,
        fields,
    })
}

fn pop_field<'a>(s: &mut Stream<'a>, width: usize) -> error::Result<Field<'a>> {
    let flags = FieldFlags::unpack(&[s.pop_uint_var(2)? as u8])
        .map_err(|e| ErrorKind::Defs(format!("bad field flags: {}", e)))?;
    let id = s.pop_str()?;
    let name = s.pop_str()?;

    let kind_tag = s.pop_u8()?;
    let kind = match kind_tag {
        KIND_BOOL => {
            let bit = s.pop_u8()?;
            assert!(
                usize::from(bit) < width,
                "field '{}': flag bit {} out of range of a {} bit register",
                id,
                bit,
                width
            );
            FieldKind::Bool { bit }
        }
        KIND_FRAC => {
            let int_part = s.pop_reg(width)?;
            let frac_part = s.pop_reg(width)?;
            assert!(
                !int_part.overlaps(&frac_part),
                "field '{}': integer and fraction masks overlap",
                id
            );
            FieldKind::Frac {
                int_part,
                frac_part,
            }
        }
        KIND_SINT | KIND_UINT => {
            let bitmask = s.pop_reg(width)?;
            FieldKind::Int {
                bitmask,
                is_signed: kind_tag == KIND_SINT,
            }
        }
        KIND_ENUM => {
            let bitmask = s.pop_reg(width)?;
            let order = bitmask.popcount();
            assert!(
                order <= 32,
                "field '{}': enum bitmask selects {} bits, maximum is 32",
                id,
                order
            );

            let num_values = s.pop_uint_var(order)? as usize;
            let mut values = Vec::with_capacity(num_values);
            for _ in 0..num_values {
                let value = s.pop_uint_var(order)?;
                let name = s.pop_str()?;
                values.push(EnumValue { value, name });
            }
            FieldKind::Enum { bitmask, values }
        }
        KIND_RESERVED => {
            let bitmask = s.pop_reg(width)?;
            FieldKind::Reserved { bitmask }
        }
        other => panic!("field '{}': unknown kind tag {}", id, other),
    };

    Ok(Field {
        flags,
        id,
        name,
        kind,
    })
}

/// Walk all registers whose absolute address falls into the inclusive
/// range `[start, end]`, in definition order (units in stream order,
/// registers in stream order within each unit - no sorting).
///
/// The first callback error stops the walk and is propagated verbatim.
/// Returns the number of registers visited; an empty or inverted range
/// visits nothing.
pub fn walk_range<'a, F>(
    units: &[Unit<'a>],
    start: u64,
    end: u64,
    mut on_register: F,
) -> error::Result<usize>
where
    F: FnMut(&Unit<'a>, &Register<'a>) -> error::Result<()>,
{
    let mut visited = 0;

    if start > end {
        return Ok(0);
    }

    for unit in units {
        if start > unit.end || end < unit.start {
            continue;
        }

        for reg in &unit.registers {
            let abs = reg.abs_addr(unit);
            if abs < start || abs > end {
                continue;
            }

            on_register(unit, reg)?;
            visited += 1;
        }
    }

    Ok(visited)
}

#[cfg(test)]
mod test {
    use super::*;

    fn push_str(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u16).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    /// Serialize a minimal unit header with `num_regs` registers promised
    fn unit_header(start: u32, end: u32, num_regs: u16) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&start.to_le_bytes());
        out.extend_from_slice(&end.to_le_bytes());
        push_str(&mut out, "u");
        push_str(&mut out, "Unit");
        out.push(0); // addr_width
        out.push(0x12); // addr little, data big
        out.extend_from_slice(&num_regs.to_le_bytes());
        out
    }

    fn one_bool_register(offset: u32) -> Vec<u8> {
        let mut out = vec![];
        out.extend_from_slice(&offset.to_le_bytes());
        out.push(16); // width
        out.push(0x03); // flags: rw
        push_str(&mut out, "r");
        push_str(&mut out, "Reg");
        out.extend_from_slice(&1u16.to_le_bytes()); // num_fields
        out.push(0x01); // field flags: read-only
        push_str(&mut out, "f");
        push_str(&mut out, "Flag");
        out.push(KIND_BOOL);
        out.push(3); // bit
        out
    }

    #[test]
    fn test_parse_empty_stream() {
        let buf = [0u8, 0];
        let (units, rest) = parse_units(&buf).unwrap();
        assert!(units.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_single_unit() {
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0x1000, 0x10ff, 1));
        buf.extend(one_bool_register(0x10));
        buf.extend_from_slice(&[0xaa, 0xbb]); // trailing bytes stay untouched

        let (units, rest) = parse_units(&buf).unwrap();
        assert_eq!(rest, &[0xaa, 0xbb]);
        assert_eq!(units.len(), 1);

        let unit = &units[0];
        assert_eq!(unit.start, 0x1000);
        assert_eq!(unit.end, 0x10ff);
        assert_eq!(unit.id, "u");
        assert_eq!(unit.name, "Unit");
        assert_eq!(unit.addr_width, 0);
        assert_eq!(
            unit.endian,
            EndianDescriptor::new(Endian::Little, Endian::Big)
        );
        assert!(unit.contains(0x1000));
        assert!(unit.contains(0x10ff));
        assert!(!unit.contains(0x1100));

        let reg = &unit.registers[0];
        assert_eq!(reg.offset, 0x10);
        assert_eq!(reg.width, 16);
        assert_eq!(reg.flags, RegisterFlags::read_write());
        assert_eq!(reg.name, "Reg");
        assert_eq!(reg.abs_addr(unit), 0x1010);

        let field = &reg.fields[0];
        assert_eq!(field.name, "Flag");
        assert!(field.flags.read);
        assert!(!field.flags.write);
        assert!(!field.flags.is_hex());
        assert_eq!(field.kind, FieldKind::Bool { bit: 3 });
    }

    #[test]
    fn test_parse_all_field_kinds() {
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0, 0xff, 1));

        let mut reg = vec![];
        reg.extend_from_slice(&0u32.to_le_bytes());
        reg.push(16);
        reg.push(0x01);
        push_str(&mut reg, "r");
        push_str(&mut reg, "Reg");
        reg.extend_from_slice(&4u16.to_le_bytes());

        // enum over bits 3:0 with two named values
        reg.push(0x00);
        push_str(&mut reg, "e");
        push_str(&mut reg, "Mode");
        reg.push(KIND_ENUM);
        reg.extend_from_slice(&[0x0f, 0x00]); // bitmask
        reg.push(2); // num_enums (order 4 -> u8)
        reg.push(0);
        push_str(&mut reg, "off");
        reg.push(5);
        push_str(&mut reg, "on");

        // signed int over the high byte, hex display
        reg.push(0x04);
        push_str(&mut reg, "i");
        push_str(&mut reg, "Level");
        reg.push(KIND_SINT);
        reg.extend_from_slice(&[0x00, 0xff]);

        // fraction with disjoint masks
        reg.push(0x00);
        push_str(&mut reg, "t");
        push_str(&mut reg, "Temp");
        reg.push(KIND_FRAC);
        reg.extend_from_slice(&[0x00, 0xff]); // int part
        reg.extend_from_slice(&[0xff, 0x00]); // frac part

        // reserved filler
        reg.push(0x00);
        push_str(&mut reg, "x");
        push_str(&mut reg, "reserved");
        reg.push(KIND_RESERVED);
        reg.extend_from_slice(&[0xf0, 0x00]);

        buf.extend(reg);

        let (units, rest) = parse_units(&buf).unwrap();
        assert!(rest.is_empty());

        let fields = &units[0].registers[0].fields;
        assert_eq!(fields.len(), 4);

        match &fields[0].kind {
            FieldKind::Enum { bitmask, values } => {
                assert_eq!(bitmask.to_u64(), 0x0f);
                assert_eq!(values.len(), 2);
                assert_eq!(values[1].value, 5);
                assert_eq!(values[1].name, "on");
            }
            other => panic!("expected enum, got {:?}", other),
        }

        match &fields[1].kind {
            FieldKind::Int { bitmask, is_signed } => {
                assert_eq!(bitmask.to_u64(), 0xff00);
                assert!(*is_signed);
                assert!(fields[1].flags.is_hex());
            }
            other => panic!("expected int, got {:?}", other),
        }

        match &fields[2].kind {
            FieldKind::Frac {
                int_part,
                frac_part,
            } => {
                assert_eq!(int_part.to_u64(), 0xff00);
                assert_eq!(frac_part.to_u64(), 0x00ff);
            }
            other => panic!("expected frac, got {:?}", other),
        }

        match &fields[3].kind {
            FieldKind::Reserved { bitmask } => assert_eq!(bitmask.to_u64(), 0x00f0),
            other => panic!("expected reserved, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_truncated_register_list() {
        // unit promises two registers but carries only one
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0x1000, 0x10ff, 2));
        buf.extend(one_bool_register(0));

        assert_eq!(parse_units(&buf).unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn test_parse_truncated_header() {
        let buf = [1u8, 0, 0x00, 0x10];
        assert_eq!(parse_units(&buf).unwrap_err().kind(), ErrorKind::Eof);
    }

    #[test]
    fn test_parse_bad_endian_descriptor() {
        let mut buf = vec![1u8, 0];
        let mut unit = unit_header(0, 0xff, 0);
        unit[4 + 4 + 3 + 6 + 1] = 0x7f; // endian byte, nibbles out of range
        buf.extend(unit);

        match parse_units(&buf).unwrap_err().kind() {
            ErrorKind::Defs(_) => (),
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    #[test]
    #[should_panic]
    fn test_parse_unknown_field_kind() {
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0, 0xff, 1));
        let mut reg = one_bool_register(0);
        let kind_at = reg.len() - 2;
        reg[kind_at] = 99;
        buf.extend(reg);

        let _ = parse_units(&buf);
    }

    #[test]
    #[should_panic]
    fn test_parse_bool_bit_out_of_range() {
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0, 0xff, 1));
        let mut reg = one_bool_register(0);
        let bit_at = reg.len() - 1;
        reg[bit_at] = 16; // register is 16 bits wide
        buf.extend(reg);

        let _ = parse_units(&buf);
    }

    #[test]
    #[should_panic]
    fn test_parse_bad_register_width() {
        let mut buf = vec![1u8, 0];
        buf.extend(unit_header(0, 0xff, 1));
        let mut reg = one_bool_register(0);
        reg[4] = 12; // width byte
        buf.extend(reg);

        let _ = parse_units(&buf);
    }

    #[test]
    fn test_flags_pack_round_trip() {
        let f = FieldFlags::new(true, false, DisplayHint::Hex);
        assert_eq!(f.pack(), [0x05]);
        assert_eq!(FieldFlags::unpack(&[0x05]).unwrap(), f);

        let r = RegisterFlags::read_write();
        assert_eq!(r.pack(), [0x03]);
        assert_eq!(RegisterFlags::unpack(&[0x03]).unwrap(), r);

        let e = EndianDescriptor::new(Endian::Big, Endian::Little);
        assert_eq!(e.pack(), [0x21]);
        assert_eq!(EndianDescriptor::unpack(&[0x21]).unwrap(), e);
    }

    #[test]
    fn test_unknown_display_hint_is_not_hex() {
        let f = FieldFlags::unpack(&[0x0c]).unwrap(); // display bits = 3
        assert_eq!(f.display, EnumCatchAll::CatchAll(3));
        assert!(!f.is_hex());
    }

    fn walk_units() -> Vec<Unit<'static>> {
        let make_reg = |offset, name| Register {
            offset,
            width: 32,
            flags: RegisterFlags::read_write(),
            id: "r",
            name,
            fields: vec![],
        };

        vec![
            Unit {
                start: 0x1000,
                end: 0x10ff,
                id: "a",
                name: "A",
                addr_width: 0,
                endian: EndianDescriptor::default(),
                registers: vec![make_reg(0, "a0"), make_reg(0x80, "a1")],
            },
            Unit {
                start: 0x2000,
                end: 0x20ff,
                id: "b",
                name: "B",
                addr_width: 0,
                endian: EndianDescriptor::default(),
                registers: vec![make_reg(0, "b0")],
            },
        ]
    }

    #[test]
    fn test_walk_range_in_definition_order() {
        let units = walk_units();
        let mut seen = vec![];

        let visited = walk_range(&units, 0x1000, 0x2000, |unit, reg| {
            seen.push((unit.id, reg.name, reg.abs_addr(unit)));
            Ok(())
        })
        .unwrap();

        assert_eq!(visited, 3);
        assert_eq!(
            seen,
            vec![
                ("a", "a0", 0x1000),
                ("a", "a1", 0x1080),
                ("b", "b0", 0x2000),
            ]
        );
    }

    #[test]
    fn test_walk_range_filters_addresses() {
        let units = walk_units();
        let mut seen = vec![];

        let visited = walk_range(&units, 0x1001, 0x1fff, |_, reg| {
            seen.push(reg.name);
            Ok(())
        })
        .unwrap();

        assert_eq!(visited, 1);
        assert_eq!(seen, vec!["a1"]);
    }

    #[test]
    fn test_walk_range_inverted_is_empty() {
        let units = walk_units();
        let visited = walk_range(&units, 0x2000, 0x1000, |_, _| {
            panic!("callback must not run");
        })
        .unwrap();
        assert_eq!(visited, 0);
    }

    #[test]
    fn test_walk_range_error_stops_iteration() {
        let units = walk_units();
        let mut calls = 0;

        let res = walk_range(&units, 0, u64::MAX, |_, _| {
            calls += 1;
            Err(ErrorKind::General("reader broke".to_string()).into())
        });

        assert!(res.is_err());
        assert_eq!(calls, 1);
    }
}
