//! Encoder and relocator for both x86 instruction widths.

pub mod relocator;
pub mod writer;
