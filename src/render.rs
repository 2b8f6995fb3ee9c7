//! Plain-text rendering of decoded registers.
//!
//! Output format, one register at a time:
//!
//! ```text
//! ======================== Clock Control ==============================
//! 0x00001000 CCM_CCR                     	0xa503
//!   Enable                              :	true
//!   Divider                             :	0x5 (ro)
//! ```
//!
//! Registers are separated by one empty line, units by their banner.
//! Reserved fields are not shown. Colouring and paging are left to outer
//! tooling; this writer emits nothing but text.

use crate::decode::Sink;
use crate::defs::{EnumValue, Field, Register, Unit};
use crate::error;
use crate::regval::{RegMax, RegValue};

use std::io::Write;

pub struct TextRenderer<W: Write> {
    out: W,
    /// Range of the unit the previous register belonged to
    last_unit: Option<(u64, u64)>,
    num_shown: usize,
}

impl<W: Write> TextRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_unit: None,
            num_shown: 0,
        }
    }

    /// Number of registers fully rendered so far
    pub fn num_shown(&self) -> usize {
        self.num_shown
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Raw register value at full register width: the `u64` view up to 64
    /// bits, the generic byte path (most-significant byte first) above
    fn raw_hex(reg: &Register<'_>, raw: &RegValue) -> String {
        if reg.width <= 64 {
            format!("{:0width$x}", raw.to_u64(), width = reg.width / 4)
        } else {
            raw.as_bytes()
                .iter()
                .rev()
                .map(|b| format!("{:02x}", b))
                .collect()
        }
    }

    /// ` (ro)` / ` (wo)` marker for one-way fields, nothing otherwise
    fn access_suffix(field: &Field<'_>) -> &'static str {
        match (field.flags.read, field.flags.write) {
            (true, false) => " (ro)",
            (false, true) => " (wo)",
            _ => "",
        }
    }

    fn field_line(&mut self, field: &Field<'_>, value: &str) -> error::Result<()> {
        writeln!(
            self.out,
            "  {:<36}:\t{}{}",
            field.name,
            value,
            Self::access_suffix(field)
        )?;
        Ok(())
    }

    /// Hex digit count for an integer field spanning `order` mask bits
    fn hex_digits(order: u32) -> usize {
        ((order + 3) / 4) as usize
    }
}

impl<W: Write> Sink for TextRenderer<W> {
    fn begin_register(
        &mut self,
        unit: &Unit<'_>,
        reg: &Register<'_>,
        raw: &RegValue,
    ) -> error::Result<()> {
        if self.last_unit != Some((unit.start, unit.end)) {
            if self.num_shown > 0 {
                writeln!(self.out)?;
            }
            writeln!(
                self.out,
                "======================== {} ==============================",
                unit.name
            )?;
            self.last_unit = Some((unit.start, unit.end));
        } else {
            writeln!(self.out)?;
        }

        writeln!(
            self.out,
            "0x{:08x} {:<28}\t0x{}",
            reg.abs_addr(unit),
            reg.name,
            Self::raw_hex(reg, raw)
        )?;
        Ok(())
    }

    fn end_register(&mut self, _unit: &Unit<'_>, _reg: &Register<'_>) -> error::Result<()> {
        self.num_shown += 1;
        Ok(())
    }

    fn bool_field(
        &mut self,
        _reg: &Register<'_>,
        field: &Field<'_>,
        value: bool,
    ) -> error::Result<()> {
        self.field_line(field, if value { "true" } else { "false" })
    }

    fn enum_field(
        &mut self,
        _reg: &Register<'_>,
        field: &Field<'_>,
        matched: Option<&EnumValue<'_>>,
        idx: RegMax,
    ) -> error::Result<()> {
        let value = match matched {
            Some(v) => v.name.to_string(),
            None => format!("#{}", idx),
        };
        self.field_line(field, &value)
    }

    fn uint_field(
        &mut self,
        _reg: &Register<'_>,
        field: &Field<'_>,
        value: RegMax,
    ) -> error::Result<()> {
        let text = if field.flags.is_hex() {
            let digits = Self::hex_digits(field_order(field));
            format!("0x{:0digits$x}", value, digits = digits)
        } else {
            format!("{}", value)
        };
        self.field_line(field, &text)
    }

    fn sint_field(
        &mut self,
        _reg: &Register<'_>,
        field: &Field<'_>,
        value: i64,
    ) -> error::Result<()> {
        let text = if field.flags.is_hex() {
            let digits = Self::hex_digits(field_order(field));
            format!("0x{:0digits$x}", value, digits = digits)
        } else {
            format!("{}", value)
        };
        self.field_line(field, &text)
    }

    fn frac_field(
        &mut self,
        _reg: &Register<'_>,
        field: &Field<'_>,
        int_part: RegMax,
        frac_part: RegMax,
        divisor: RegMax,
    ) -> error::Result<()> {
        let value = int_part as f64 + frac_part as f64 / divisor as f64;
        self.field_line(field, &format!("{:.6}", value))
    }

    // reserved fields fall through to the default no-op
}

/// Number of mask bits of an integer field, for hex zero-padding
fn field_order(field: &Field<'_>) -> u32 {
    use crate::defs::FieldKind;

    match &field.kind {
        FieldKind::Int { bitmask, .. } => bitmask.popcount(),
        FieldKind::Enum { bitmask, .. } => bitmask.popcount(),
        FieldKind::Reserved { bitmask } => bitmask.popcount(),
        FieldKind::Bool { .. } => 1,
        FieldKind::Frac {
            int_part,
            frac_part,
        } => int_part.popcount() + frac_part.popcount(),
    }
}
