//! Call state machines: an inbound call with its response writer, and the
//!  outbound mirror image.

pub mod inbound;
pub mod outbound;
