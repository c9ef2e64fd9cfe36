//! Binary framing of general message payloads.
//!
//! A general response payload is laid out as
//!
//! ```text
//! requestId (32 bytes)
//! statusCode (varint)
//! headerCount (varint)
//! { keyLen (varint) key, valLen (varint) val } * headerCount
//! bodyLen (varint, -1 when there is no body)
//! body
//! ```
//!
//! Varints are Bitcoin compact-size integers. The `-1` sentinel is written the
//! way a signed 64-bit `-1` is written: `0xff` followed by eight `0xff` bytes.

use crate::error::{Error, Result};
use crate::message::{RequestId, REQUEST_ID_LEN};

/// Compact-size value standing for "absent".
const ABSENT: u64 = u64::MAX;

/// Append a compact-size varint.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor over a payload that fails with `MalformedMessage` on any overrun.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::malformed(format!(
                "need {} bytes at offset {}, only {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let first = self.read_bytes(1)?[0];
        let value = match first {
            0xfd => {
                let mut raw = [0u8; 2];
                raw.copy_from_slice(self.read_bytes(2)?);
                u16::from_le_bytes(raw) as u64
            }
            0xfe => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(self.read_bytes(4)?);
                u32::from_le_bytes(raw) as u64
            }
            0xff => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(self.read_bytes(8)?);
                u64::from_le_bytes(raw)
            }
            small => small as u64,
        };
        Ok(value)
    }

    /// Read a varint that must be a usable length within the buffer.
    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_varint()?;
        if len > self.remaining() as u64 {
            return Err(Error::malformed(format!(
                "declared length {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        Ok(len as usize)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::malformed(format!("header is not utf-8: {}", e)))
    }
}

/// Application response carried in a general message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub request_id: RequestId,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// `None` is distinct from an empty body on the wire.
    pub body: Option<Vec<u8>>,
}

impl ResponseFrame {
    pub fn new(request_id: RequestId, status: u16) -> Self {
        Self {
            request_id,
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_ID_LEN + 16);
        buf.extend_from_slice(self.request_id.as_bytes());
        write_varint(&mut buf, self.status as u64);
        write_varint(&mut buf, self.headers.len() as u64);
        for (name, value) in &self.headers {
            write_bytes(&mut buf, name.as_bytes());
            write_bytes(&mut buf, value.as_bytes());
        }
        match &self.body {
            Some(body) => write_bytes(&mut buf, body),
            None => write_varint(&mut buf, ABSENT),
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(payload);
        let request_id = RequestId::from_slice(reader.read_bytes(REQUEST_ID_LEN)?)?;

        let status = reader.read_varint()?;
        let status = u16::try_from(status)
            .map_err(|_| Error::malformed(format!("status code {} out of range", status)))?;

        let count = reader.read_varint()?;
        // Each header needs at least two length bytes.
        if count.saturating_mul(2) > reader.remaining() as u64 {
            return Err(Error::malformed(format!(
                "header count {} exceeds payload",
                count
            )));
        }
        let mut headers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = reader.read_string()?;
            let value = reader.read_string()?;
            headers.push((name, value));
        }

        let body_len = reader.read_varint()?;
        let body = if body_len == ABSENT {
            None
        } else {
            if body_len > reader.remaining() as u64 {
                return Err(Error::malformed(format!(
                    "body length {} exceeds remaining {} bytes",
                    body_len,
                    reader.remaining()
                )));
            }
            Some(reader.read_bytes(body_len as usize)?.to_vec())
        };

        if reader.remaining() != 0 {
            return Err(Error::malformed(format!(
                "{} trailing bytes after body",
                reader.remaining()
            )));
        }

        Ok(Self {
            request_id,
            status,
            headers,
            body,
        })
    }
}
