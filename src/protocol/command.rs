//! Memory read command
//!
//! The only request the client ever sends.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// A request for `length` bytes starting at `address`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCommand {
    pub address: u64,
    pub length: usize,
}

impl ReadCommand {
    pub fn new(address: u64, length: usize) -> Self {
        Self { address, length }
    }

    /// Append the wire form of the command to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.to_string().as_bytes());
    }
}

impl fmt::Display for ReadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "m{:x},{:x}", self.address, self.length)
    }
}
