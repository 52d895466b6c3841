//! WebSocket transport and the binary wire format

pub mod bitstream;
pub mod handler;
pub mod protocol;
