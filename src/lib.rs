//! Decoder for memory-mapped CPU/SoC registers.
//!
//! A compact binary *definitions stream* describes a machine's register
//! map: *units* (contiguous address regions) own *registers*, registers
//! own *fields*, and every field carries a decoding rule - flag bit,
//! enumeration, signed/unsigned integer, fixed-point fraction or reserved
//! filler. Given such a stream and a device [`reader::Reader`], the crate
//! walks an address range, reads each register and emits one decoded,
//! typed value per field through a [`decode::Sink`].
//!
//! The definitions stream is parsed zero-copy: all identifiers in the
//! resulting tree borrow from the input buffer.

pub mod decode;
pub mod defs;
pub mod error;
pub mod reader;
pub mod regval;
pub mod render;
pub mod serialize;
pub mod stream;

pub use decode::{decode_one, decode_register, Sink};
pub use defs::{parse_units, walk_range};
pub use regval::{RegMax, RegValue};
