//! Protocol implementations.

pub mod codec;
pub mod frame;

// Re-export common types
pub use codec::{BoardVersion, Command, DataChunk, Opcode, Response};
pub use frame::{CAN_MAX_DLEN, CanFrame};
