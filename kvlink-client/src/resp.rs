//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies for both the
//! blocking transport (streaming `BufRead`) and the tokio transport
//! (incremental parsing over an in-memory buffer).
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Callers own the buffers; the codec only fills them.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use std::io::{BufRead, Read};

use crate::error::{ClientError, ClientResult};

/// Largest bulk string accepted from a server (the Redis default limit).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on up-front allocation for a declared length.
const PREALLOC_LIMIT: usize = 1024;

/// RESP reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style replies.
    Simple(Vec<u8>),
    /// -ERR ... replies.
    Error(Vec<u8>),
    /// :123 replies.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.push(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Reads one RESP value from the buffered reader.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line_buf[0] {
        b'+' => Ok(RespValue::Simple(line_buf[1..].to_vec())),
        b'-' => Ok(RespValue::Error(line_buf[1..].to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            read_array(reader, len, line_buf)
        }
        _ => Err(ClientError::Protocol),
    }
}

/// Parses one RESP value from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds an incomplete frame, otherwise the
/// value and the number of bytes it occupied. Nothing is consumed; the caller
/// advances its buffer by the returned length.
pub fn parse_frame(buf: &[u8]) -> ClientResult<Option<(RespValue, usize)>> {
    let (line, mut pos) = match split_line(buf)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ClientError::Protocol);
    }

    let value = match line[0] {
        b'+' => RespValue::Simple(line[1..].to_vec()),
        b'-' => RespValue::Error(line[1..].to_vec()),
        b':' => RespValue::Integer(parse_i64(&line[1..])?),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            if len < 0 {
                RespValue::Bulk(None)
            } else {
                let end = pos + bulk_len(len)?;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != b"\r\n" {
                    return Err(ClientError::Protocol);
                }
                let data = buf[pos..end].to_vec();
                pos = end + 2;
                RespValue::Bulk(Some(data))
            }
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            let mut items = Vec::with_capacity(prealloc(len));
            for _ in 0..len.max(0) {
                match parse_frame(&buf[pos..])? {
                    Some((item, used)) => {
                        items.push(item);
                        pos += used;
                    }
                    None => return Ok(None),
                }
            }
            RespValue::Array(items)
        }
        _ => return Err(ClientError::Protocol),
    };

    Ok(Some((value, pos)))
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    let len = bulk_len(len)?;
    let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() < len {
        return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != [b'\r', b'\n'] {
        return Err(ClientError::Protocol);
    }

    line_buf.clear();
    Ok(RespValue::Bulk(Some(data)))
}

fn read_array<R: BufRead>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>) -> ClientResult<RespValue> {
    if len <= 0 {
        return Ok(RespValue::Array(Vec::new()));
    }

    let mut items = Vec::with_capacity(prealloc(len));
    for _ in 0..len {
        items.push(read_response(reader, line_buf)?);
    }
    Ok(RespValue::Array(items))
}

/// Validates a declared bulk length.
fn bulk_len(len: i64) -> ClientResult<usize> {
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol);
    }
    usize::try_from(len).map_err(|_| ClientError::Protocol)
}

/// Capacity to reserve for `len` items; the vector grows as items arrive.
fn prealloc(len: i64) -> usize {
    usize::try_from(len).unwrap_or(0).min(PREALLOC_LIMIT)
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        // Peer closed the stream between replies.
        return Err(ClientError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol);
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

/// Finds the first CRLF-terminated line; returns it without the terminator
/// plus the offset just past it.
fn split_line(buf: &[u8]) -> ClientResult<Option<(&[u8], usize)>> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            if idx == 0 || buf[idx - 1] != b'\r' {
                return Err(ClientError::Protocol);
            }
            Ok(Some((&buf[..idx - 1], idx + 1)))
        }
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    if data.is_empty() {
        return Err(ClientError::Protocol);
    }
    let (negative, digits) = match data[0] {
        b'-' => (true, &data[1..]),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    Ok(if negative { -value } else { value })
}

fn push_usize(out: &mut Vec<u8>, mut value: usize) {
    // Digits go into a stack buffer first so the output is written in order.
    let mut buf = [0u8; 20];
    let mut len = 0;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    out.extend(buf[..len].iter().rev());
}
