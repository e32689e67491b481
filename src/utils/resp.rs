//! RESP (REdis Serialization Protocol) values, encoder and decoder
//!
//! Commands are encoded as arrays of bulk strings. The decoder works on
//! raw bytes: frame headers are scanned up to the line terminator and
//! their integers parsed with checked arithmetic, bulk payloads are read
//! together with their trailing terminator in one pass, and malformed
//! frames surface as [`ProtocolError`] while stream failures surface as
//! transport errors. [`RespValue`] carries the redirection classifiers
//! the cluster dispatcher needs (`MOVED`, `ASK`, `TRYAGAIN`, `NOSCRIPT`).

use std::io::{self, BufRead};

use super::error::{ClientError, ProtocolError, Result};

/// Upper bound the server places on a single bulk payload (512 MiB)
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Redirection classification of a server error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    /// Slot ownership moved permanently; re-target and refresh
    Moved(String),
    /// Slot is migrating; re-attempt once at the target after ASKING
    Ask(String),
    /// Transient state on the same node; retry shortly
    TryAgain,
}

/// RESP value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:1000\r\n)
    Integer(i64),
    /// Bulk string ($6\r\nfoobar\r\n)
    BulkString(Vec<u8>),
    /// Null bulk string ($-1\r\n)
    Null,
    /// Array (*2\r\n...)
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Check if this is a nil reply
    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// Check if this is a MOVED error
    pub fn is_moved(&self) -> bool {
        matches!(self, RespValue::Error(e) if e.starts_with("MOVED"))
    }

    /// Check if this is an ASK error
    pub fn is_ask(&self) -> bool {
        matches!(self, RespValue::Error(e) if e.starts_with("ASK"))
    }

    /// Check if this is a TRYAGAIN error
    pub fn is_try_again(&self) -> bool {
        matches!(self, RespValue::Error(e) if e.starts_with("TRYAGAIN"))
    }

    /// Check if the server reported an unknown script digest
    pub fn is_no_script(&self) -> bool {
        matches!(self, RespValue::Error(e) if e.starts_with("NOSCRIPT"))
    }

    /// Classify a routing error reply
    ///
    /// Parses `MOVED <slot> <host>:<port>` and `ASK <slot> <host>:<port>`
    /// into the target address; `TRYAGAIN` carries no target.
    pub fn redirect(&self) -> Option<Redirect> {
        let msg = match self {
            RespValue::Error(e) => e,
            _ => return None,
        };
        if msg.starts_with("TRYAGAIN") {
            return Some(Redirect::TryAgain);
        }
        let mut parts = msg.split_whitespace();
        let kind = parts.next()?;
        if kind != "MOVED" && kind != "ASK" {
            return None;
        }
        let _slot: u16 = parts.next()?.parse().ok()?;
        let addr = parts.next()?;
        // host:port, where host may itself contain ':' for IPv6
        addr.rsplit_once(':')?.1.parse::<u16>().ok()?;
        match kind {
            "MOVED" => Some(Redirect::Moved(addr.to_string())),
            _ => Some(Redirect::Ask(addr.to_string())),
        }
    }

    /// Get the server error message for a non-routing error reply
    pub fn as_server_error(&self) -> Option<&str> {
        match self {
            RespValue::Error(e) if self.redirect().is_none() => Some(e),
            _ => None,
        }
    }

    /// Get as string (for simple string or bulk string)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as bytes (for bulk string)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Interpret a flat field-value array (HGETALL shape) as pairs
    ///
    /// Nil field values are skipped, matching "missing fields
    /// deserialise as absent".
    pub fn as_field_map(&self) -> Option<Vec<(String, String)>> {
        let arr = self.as_array()?;
        let mut out = Vec::with_capacity(arr.len() / 2);
        for pair in arr.chunks_exact(2) {
            let field = pair[0].as_str()?;
            if pair[1].is_nil() {
                continue;
            }
            let value = pair[1].as_str()?;
            out.push((field.to_string(), value.to_string()));
        }
        Some(out)
    }
}

/// Encodes commands as RESP arrays of bulk strings
pub struct RespEncoder {
    buf: Vec<u8>,
}

impl RespEncoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Drop any encoded frames so the buffer can be reused
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Append one command frame; every argument becomes a bulk string
    pub fn encode_command<A: AsRef<[u8]>>(&mut self, args: &[A]) {
        self.header(b'*', args.len() as i64);
        for arg in args {
            let arg = arg.as_ref();
            self.header(b'$', arg.len() as i64);
            self.buf.extend_from_slice(arg);
            self.terminator();
        }
    }

    fn header(&mut self, marker: u8, n: i64) {
        self.buf.push(marker);
        let mut digits = itoa::Buffer::new();
        self.buf.extend_from_slice(digits.format(n).as_bytes());
        self.terminator();
    }

    fn terminator(&mut self) {
        self.buf.extend_from_slice(b"\r\n");
    }
}

/// Streaming RESP decoder over a buffered reader
pub struct RespDecoder<R> {
    reader: R,
    /// Scratch space holding the current frame header, terminator
    /// stripped
    header: Vec<u8>,
}

impl<R: BufRead> RespDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            header: Vec::with_capacity(64),
        }
    }

    /// Decode the next value from the stream
    pub fn decode(&mut self) -> Result<RespValue> {
        self.next_header()?;
        match self.header[0] {
            b'+' => Ok(RespValue::SimpleString(self.header_text()?)),
            b'-' => Ok(RespValue::Error(self.header_text()?)),
            b':' => Ok(RespValue::Integer(self.header_int()?)),
            b'$' => {
                let len = self.header_int()?;
                if len < 0 {
                    return Ok(RespValue::Null);
                }
                if len > MAX_BULK_LEN {
                    return Err(ProtocolError::InvalidLength(len).into());
                }
                self.bulk_payload(len as usize)
            }
            b'*' => {
                let count = self.header_int()?;
                if count < 0 {
                    return Ok(RespValue::Null);
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                Ok(RespValue::Array(items))
            }
            other => Err(ProtocolError::InvalidType(other).into()),
        }
    }

    /// Decode a fixed number of replies (pipeline responses)
    pub fn decode_pipeline(&mut self, count: usize) -> Result<Vec<RespValue>> {
        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(self.decode()?);
        }
        Ok(replies)
    }

    fn next_header(&mut self) -> Result<()> {
        self.header.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.header)
            .map_err(ClientError::from)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the stream mid-reply",
            )
            .into());
        }
        while matches!(self.header.last(), Some(b'\r') | Some(b'\n')) {
            self.header.pop();
        }
        if self.header.is_empty() {
            return Err(ProtocolError::Parse("empty frame header".into()).into());
        }
        Ok(())
    }

    fn header_text(&self) -> Result<String> {
        String::from_utf8(self.header[1..].to_vec())
            .map_err(|_| ProtocolError::Parse("frame header is not UTF-8".into()).into())
    }

    fn header_int(&self) -> Result<i64> {
        let digits = &self.header[1..];
        let (negative, digits) = match digits.first() {
            Some(b'-') => (true, &digits[1..]),
            _ => (false, digits),
        };
        if digits.is_empty() {
            return Err(ProtocolError::Parse("empty integer header".into()).into());
        }
        let mut n: i64 = 0;
        for &byte in digits {
            if !byte.is_ascii_digit() {
                return Err(ProtocolError::Parse("integer header has non-digit".into()).into());
            }
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(i64::from(byte - b'0')))
                .ok_or_else(|| ProtocolError::Parse("integer header out of range".into()))?;
        }
        Ok(if negative { -n } else { n })
    }

    /// Read `len` payload bytes plus the trailing terminator in one pass
    fn bulk_payload(&mut self, len: usize) -> Result<RespValue> {
        let mut data = vec![0u8; len + 2];
        self.reader.read_exact(&mut data).map_err(ClientError::from)?;
        if !data.ends_with(b"\r\n") {
            return Err(ProtocolError::Parse("bulk payload missing terminator".into()).into());
        }
        data.truncate(len);
        Ok(RespValue::BulkString(data))
    }
}
