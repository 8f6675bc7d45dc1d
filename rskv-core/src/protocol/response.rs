use bytes::Bytes;

use super::ProtocolError;

/// One `VALUE` block of a retrieval response.
#[derive(Debug, PartialEq)]
pub(crate) struct Value {
    pub key: Vec<u8>,
    pub flags: u32,
    pub data: Bytes,
}

/// Find the next CRLF-terminated line starting at `pos`. Returns the line
/// (without the terminator) and the position just past it.
fn next_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &buf[pos..];
    rest.windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (&rest[..i], pos + i + 2))
}

/// Classify a line the current parser did not expect. Server-reported errors
/// become [`ProtocolError::Server`], everything else is unexpected.
fn error_line(line: &[u8]) -> ProtocolError {
    let text = String::from_utf8_lossy(line).into_owned();
    if line == b"ERROR"
        || line.starts_with(b"CLIENT_ERROR")
        || line.starts_with(b"SERVER_ERROR")
    {
        ProtocolError::Server(text)
    } else {
        ProtocolError::UnexpectedLine(text)
    }
}

fn parse_int<T: std::str::FromStr>(field: &[u8]) -> Option<T> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

/// Incrementally parse a retrieval response: zero or more `VALUE <key>
/// <flags> <len>` blocks terminated by `END`. Returns `Ok(None)` until the
/// whole response has arrived. The data block length comes from the header,
/// so values containing CRLF or even `END` survive intact.
pub(crate) fn parse_values(buf: &[u8]) -> Result<Option<Vec<Value>>, ProtocolError> {
    let mut values = Vec::new();
    let mut pos = 0;
    loop {
        let (line, after) = match next_line(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line == b"END" {
            return Ok(Some(values));
        }
        let fields = match line.strip_prefix(b"VALUE ") {
            Some(rest) => rest.split(|&b| b == b' ').collect::<Vec<_>>(),
            None => return Err(error_line(line)),
        };
        // "<key> <flags> <len>" with an optional trailing cas id.
        if fields.len() < 3 {
            return Err(ProtocolError::BadValueHeader(
                String::from_utf8_lossy(line).into_owned(),
            ));
        }
        let flags: u32 = parse_int(fields[1]).ok_or_else(|| {
            ProtocolError::BadValueHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        let len: usize = parse_int(fields[2]).ok_or_else(|| {
            ProtocolError::BadValueHeader(String::from_utf8_lossy(line).into_owned())
        })?;
        let data_end = after + len;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(ProtocolError::BadDataBlock);
        }
        values.push(Value {
            key: fields[0].to_vec(),
            flags,
            data: Bytes::copy_from_slice(&buf[after..data_end]),
        });
        pos = data_end + 2;
    }
}

/// Parse a storage reply. `STORED` is success; the polite refusals all map
/// to `false`.
pub(crate) fn parse_stored(buf: &[u8]) -> Result<Option<bool>, ProtocolError> {
    let (line, _) = match next_line(buf, 0) {
        Some(found) => found,
        None => return Ok(None),
    };
    match line {
        b"STORED" => Ok(Some(true)),
        b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" => Ok(Some(false)),
        other => Err(error_line(other)),
    }
}

/// Parse a delete reply.
pub(crate) fn parse_deleted(buf: &[u8]) -> Result<Option<bool>, ProtocolError> {
    let (line, _) = match next_line(buf, 0) {
        Some(found) => found,
        None => return Ok(None),
    };
    match line {
        b"DELETED" => Ok(Some(true)),
        b"NOT_FOUND" => Ok(Some(false)),
        other => Err(error_line(other)),
    }
}

/// Parse an incr reply. A missing counter reads as zero.
pub(crate) fn parse_incr(buf: &[u8]) -> Result<Option<u64>, ProtocolError> {
    let (line, _) = match next_line(buf, 0) {
        Some(found) => found,
        None => return Ok(None),
    };
    if line == b"NOT_FOUND" {
        return Ok(Some(0));
    }
    match parse_int(line) {
        Some(n) => Ok(Some(n)),
        None => Err(error_line(line)),
    }
}

/// Parse a `VERSION <string>` reply.
pub(crate) fn parse_version(buf: &[u8]) -> Result<Option<String>, ProtocolError> {
    let (line, _) = match next_line(buf, 0) {
        Some(found) => found,
        None => return Ok(None),
    };
    match line.strip_prefix(b"VERSION ") {
        Some(rest) => Ok(Some(String::from_utf8_lossy(rest).into_owned())),
        None => Err(error_line(line)),
    }
}
