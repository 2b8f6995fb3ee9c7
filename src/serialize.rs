//! Serializer for register definitions.
//!
//! Exact inverse of [`crate::defs::parse_units`]: emits the canonical
//! little-endian stream layout. Definition trees are usually produced by
//! offline tooling; this module mainly keeps the format honest (the
//! round-trip law `parse(serialize(t)) == t` is tested) and lets tests
//! and callers build streams without hand-assembling bytes.

use crate::defs::{
    Field, FieldKind, Register, Unit, KIND_BOOL, KIND_ENUM, KIND_FRAC, KIND_RESERVED, KIND_SINT,
    KIND_UINT,
};
use crate::regval::RegValue;

use packed_struct::prelude::*;

/// Serialize a definition tree into a fresh byte buffer
pub fn serialize_units(units: &[Unit<'_>]) -> Vec<u8> {
    let mut w = Writer::default();

    w.push_u16(count16(units.len()));
    for unit in units {
        w.push_unit(unit);
    }

    w.out
}

fn count16(cnt: usize) -> u16 {
    assert!(
        cnt <= usize::from(u16::MAX),
        "element count {} overflows the wire format",
        cnt
    );
    cnt as u16
}

fn addr32(v: u64) -> u32 {
    assert!(
        v <= u64::from(u32::MAX),
        "address {:#x} overflows the wire format",
        v
    );
    v as u32
}

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn push_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn push_u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    /// Counterpart of `Stream::pop_uint_var`
    fn push_uint_var(&mut self, v: u32, order: u32) {
        if order <= 8 {
            assert!(v <= u32::from(u8::MAX), "{} does not fit one byte", v);
            self.push_u8(v as u8);
        } else if order <= 16 {
            assert!(v <= u32::from(u16::MAX), "{} does not fit two bytes", v);
            self.push_u16(v as u16);
        } else if order <= 32 {
            self.push_u32(v);
        } else {
            panic!("variable integer order {} out of range", order);
        }
    }

    fn push_str(&mut self, s: &str) {
        self.push_u16(count16(s.len()));
        self.out.extend_from_slice(s.as_bytes());
    }

    fn push_reg(&mut self, v: &RegValue) {
        self.out.extend_from_slice(v.as_bytes());
    }

    fn push_unit(&mut self, unit: &Unit<'_>) {
        self.push_u32(addr32(unit.start));
        self.push_u32(addr32(unit.end));
        self.push_str(unit.id);
        self.push_str(unit.name);
        self.push_u8(unit.addr_width);
        self.push_u8(unit.endian.pack()[0]);

        self.push_u16(count16(unit.registers.len()));
        for reg in &unit.registers {
            self.push_register(reg);
        }
    }

    fn push_register(&mut self, reg: &Register<'_>) {
        self.push_u32(addr32(reg.offset));
        assert!(
            reg.width <= usize::from(u8::MAX),
            "register width {} overflows the wire format",
            reg.width
        );
        self.push_u8(reg.width as u8);
        self.push_uint_var(u32::from(reg.flags.pack()[0]), 2);
        self.push_str(reg.id);
        self.push_str(reg.name);

        self.push_u16(count16(reg.fields.len()));
        for field in &reg.fields {
            self.push_field(field);
        }
    }

    fn push_field(&mut self, field: &Field<'_>) {
        self.push_uint_var(u32::from(field.flags.pack()[0]), 2);
        self.push_str(field.id);
        self.push_str(field.name);

        match &field.kind {
            FieldKind::Bool { bit } => {
                self.push_u8(KIND_BOOL);
                self.push_u8(*bit);
            }
            FieldKind::Frac {
                int_part,
                frac_part,
            } => {
                self.push_u8(KIND_FRAC);
                self.push_reg(int_part);
                self.push_reg(frac_part);
            }
            FieldKind::Int { bitmask, is_signed } => {
                self.push_u8(if *is_signed { KIND_SINT } else { KIND_UINT });
                self.push_reg(bitmask);
            }
            FieldKind::Enum { bitmask, values } => {
                self.push_u8(KIND_ENUM);
                self.push_reg(bitmask);
                let order = bitmask.popcount();
                self.push_uint_var(u32::from(count16(values.len())), order);
                for v in values {
                    self.push_uint_var(v.value, order);
                    self.push_str(v.name);
                }
            }
            FieldKind::Reserved { bitmask } => {
                self.push_u8(KIND_RESERVED);
                self.push_reg(bitmask);
            }
        }
    }
}
