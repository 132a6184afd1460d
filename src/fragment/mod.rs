//! Fragmentation codec: splitting the three argument streams of a call into
//!  chunked fragments on the way out, and reassembling them on the way in.

pub(crate) mod reader;
pub(crate) mod writer;

/// Bit 0 of a call fragment's flag byte: more fragments for this message id
///  follow. The terminal fragment has it cleared.
pub(crate) const FLAG_MORE_FRAGMENTS: u8 = 0x01;
