//! Field decoding and the renderer interface.
//!
//! The decoders never format anything themselves: each field of a register
//! is turned into a typed value and handed to a [`Sink`] together with its
//! descriptor. Renderers, test probes and machine consumers all sit behind
//! the same trait.

use crate::defs::{EnumValue, Field, FieldKind, Register, Unit};
use crate::error;
use crate::regval::{RegMax, RegValue};

/// Receiver of decoded registers and fields.
///
/// For every decoded register the driver calls `begin_register`, then one
/// of the per-kind methods per field in declaration order, then
/// `end_register`. Errors propagate out of the decode and stop it.
pub trait Sink {
    /// A register is about to be decoded; `raw` is the value just read
    fn begin_register(
        &mut self,
        unit: &Unit<'_>,
        reg: &Register<'_>,
        raw: &RegValue,
    ) -> error::Result<()> {
        let _ = (unit, reg, raw);
        Ok(())
    }

    /// All fields of the register have been emitted
    fn end_register(&mut self, unit: &Unit<'_>, reg: &Register<'_>) -> error::Result<()> {
        let _ = (unit, reg);
        Ok(())
    }

    fn bool_field(&mut self, reg: &Register<'_>, field: &Field<'_>, value: bool)
        -> error::Result<()>;

    /// `matched` is the first enum entry whose value equals the extracted
    /// index, or `None` for an index the definitions do not name
    fn enum_field(
        &mut self,
        reg: &Register<'_>,
        field: &Field<'_>,
        matched: Option<&EnumValue<'_>>,
        idx: RegMax,
    ) -> error::Result<()>;

    fn uint_field(
        &mut self,
        reg: &Register<'_>,
        field: &Field<'_>,
        value: RegMax,
    ) -> error::Result<()>;

    fn sint_field(&mut self, reg: &Register<'_>, field: &Field<'_>, value: i64)
        -> error::Result<()>;

    /// Fixed-point value `int_part + frac_part / divisor`
    fn frac_field(
        &mut self,
        reg: &Register<'_>,
        field: &Field<'_>,
        int_part: RegMax,
        frac_part: RegMax,
        divisor: RegMax,
    ) -> error::Result<()>;

    /// Reserved ranges carry no value; the default is to ignore them
    fn reserved_field(
        &mut self,
        reg: &Register<'_>,
        field: &Field<'_>,
        raw: &RegValue,
    ) -> error::Result<()> {
        let _ = (reg, field, raw);
        Ok(())
    }
}

/// Decode every field of `reg` out of the shared raw value `raw`,
/// emitting one sink call per field in declaration order.
pub fn decode_register(
    reg: &Register<'_>,
    raw: &RegValue,
    sink: &mut dyn Sink,
) -> error::Result<()> {
    for field in &reg.fields {
        match &field.kind {
            FieldKind::Bool { bit } => {
                sink.bool_field(reg, field, raw.bit(usize::from(*bit)))?;
            }

            FieldKind::Int { bitmask, is_signed } => {
                if *is_signed {
                    sink.sint_field(reg, field, raw.extract_signed(bitmask))?;
                } else {
                    sink.uint_field(reg, field, raw.extract(bitmask))?;
                }
            }

            FieldKind::Frac {
                int_part,
                frac_part,
            } => {
                let int = raw.extract(int_part);
                let frac = raw.extract(frac_part);
                let order = frac_part.popcount();
                assert!(
                    order < RegMax::BITS,
                    "fraction mask selects {} bits, divisor not representable",
                    order
                );
                sink.frac_field(reg, field, int, frac, 1 << order)?;
            }

            FieldKind::Enum { bitmask, values } => {
                let idx = raw.extract(bitmask);
                let matched = values.iter().find(|v| RegMax::from(v.value) == idx);
                sink.enum_field(reg, field, matched, idx)?;
            }

            FieldKind::Reserved { .. } => {
                sink.reserved_field(reg, field, raw)?;
            }
        }
    }

    Ok(())
}

/// Decode the single register living at the absolute address `addr` from
/// a caller-supplied raw value. The first unit containing the address is
/// searched; returns whether a register matched.
pub fn decode_one(
    units: &[Unit<'_>],
    addr: u64,
    raw: &RegValue,
    sink: &mut dyn Sink,
) -> error::Result<bool> {
    for unit in units {
        if !unit.contains(addr) {
            continue;
        }

        for reg in &unit.registers {
            if reg.abs_addr(unit) != addr {
                continue;
            }

            sink.begin_register(unit, reg, raw)?;
            decode_register(reg, raw, sink)?;
            sink.end_register(unit, reg)?;
            return Ok(true);
        }
    }

    Ok(false)
}
