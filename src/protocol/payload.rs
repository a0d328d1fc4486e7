//! SSH request payload codec
//!
//! Channel and global requests carry their arguments as a flat sequence of
//! RFC 4251 fields: `string` (u32 big-endian length followed by that many
//! bytes), `uint32` and `boolean`. The relay only decodes them to learn what
//! a channel is used for; the original bytes are always forwarded as-is.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Cursor over a request payload
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::InvalidMessage(
                "payload too short for uint32".to_string(),
            ));
        }
        Ok(self.buf.get_u32())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        if !self.buf.has_remaining() {
            return Err(Error::InvalidMessage(
                "payload too short for boolean".to_string(),
            ));
        }
        Ok(self.buf.get_u8() != 0)
    }

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()?;
        let len = usize::try_from(len).map_err(|_| {
            Error::InvalidMessage(format!("string length {} cannot be converted", len))
        })?;
        if self.buf.remaining() < len {
            return Err(Error::InvalidMessage(format!(
                "string length {} exceeds remaining {} bytes",
                len,
                self.buf.remaining()
            )));
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    /// Read a length-prefixed string, replacing invalid UTF-8
    pub fn read_string(&mut self) -> Result<String> {
        self.read_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Decode every string in `payload` until it is exhausted
pub fn read_payloads(payload: &[u8]) -> Result<Vec<String>> {
    let mut reader = PayloadReader::new(payload);
    let mut strings = Vec::new();
    while !reader.is_empty() {
        strings.push(reader.read_string()?);
    }
    Ok(strings)
}

/// Builder for request payloads
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(mut self, value: u32) -> Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_bool(mut self, value: bool) -> Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    pub fn put_bytes(mut self, value: &[u8]) -> Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    pub fn put_string(self, value: &str) -> Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Endpoints carried in `direct-tcpip` / `forwarded-tcpip` channel-open data
///
/// For `direct-tcpip` the first pair is the destination the client wants to
/// reach; for `forwarded-tcpip` it is the address that was connected on the
/// server side. The second pair is always the originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpInfo {
    pub address: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl TcpInfo {
    pub fn parse(extra: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(extra);
        Ok(Self {
            address: reader.read_string()?,
            port: reader.read_u32()?,
            originator_address: reader.read_string()?,
            originator_port: reader.read_u32()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        PayloadWriter::new()
            .put_string(&self.address)
            .put_u32(self.port)
            .put_string(&self.originator_address)
            .put_u32(self.originator_port)
            .finish()
    }
}
