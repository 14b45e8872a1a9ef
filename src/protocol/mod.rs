//! Protocol module - Defines the memory-read dialect spoken to the stub
//!
//! The protocol is a plain text exchange over a stream socket:
//! - Request: `m<address>,<length>\n`, both lowercase hex without a `0x` prefix
//! - Response: the requested bytes as hex text, optionally newline terminated
//! - Error reply: `E<nn>` (two hex digits)

mod command;
mod codec;

pub use command::*;
pub use codec::*;

/// Default port of the memory stub
pub const DEFAULT_PORT: u16 = 2345;

/// Receive buffer used by single-read framing
pub const SINGLE_READ_BUFFER_SIZE: usize = 1024;

/// Largest response accepted before the frame is rejected (1 MB of hex text)
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;
