//! Wire model of the UFI command/response interface of a PIM rank.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what travels over one control interface (slice) per
//! round-trip: the 64-bit command word layout, the opcode catalogue, the
//! redundant color code carried in every response, the byte-order discovery
//! signal, program-counter encoding, and rank topology indexing.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`wire`] | Word layout, reserved words, opcodes, command encoders, response fields |
//! | [`color`] | Color bit encoding and popcount classification |
//! | [`pc`] | PC width per IRAM size, MSB/LSB split and reassembly |
//! | [`topology`] | Slices × DPUs geometry, bounds-checked (slice, member) indexing |
//!
//! # Word layout
//!
//! ```text
//!  63      56 55      48 47      40 39                                0
//! +----------+----------+----------+-----------------------------------+
//! | sentinel |  color   |  echo    |               data                |  response
//! +----------+----------+----------+-----------------------------------+
//! |  opcode  |                      payload                            |  command
//! +----------+---------------------------------------------------------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod color;
pub mod pc;
pub mod topology;
pub mod wire;

pub use color::ColorClass;
pub use pc::PcMode;
pub use topology::{DpuId, Topology};
pub use wire::Opcode;
