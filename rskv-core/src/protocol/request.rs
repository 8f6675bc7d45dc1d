use super::{ProtocolError, CRLF, MAX_KEY_LEN};

/// Keys travel inline on command lines, so anything that would break the
/// line framing is rejected before any I/O happens.
fn check_key(key: &[u8]) -> Result<(), ProtocolError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN || key.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(ProtocolError::InvalidKey(key.to_vec()));
    }
    Ok(())
}

/// Render `get <k1> [<k2> ...]` for one or more keys.
pub(crate) fn get(keys: &[&[u8]]) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::with_capacity(4 + keys.iter().map(|k| k.len() + 1).sum::<usize>());
    buf.extend_from_slice(b"get");
    for key in keys {
        check_key(key)?;
        buf.push(b' ');
        buf.extend_from_slice(key);
    }
    buf.extend_from_slice(CRLF);
    Ok(buf)
}

/// Render `set <key> <flags> <rev> <len>` followed by the data block. The
/// third field carries the revision in this dialect; plain memcached reads
/// it as an expiration time, which is exactly what the cache layer wants.
pub(crate) fn set(key: &[u8], flags: u32, rev: u32, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_key(key)?;
    let mut buf = Vec::with_capacity(key.len() + data.len() + 32);
    buf.extend_from_slice(b"set ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(format!(" {} {} {}", flags, rev, data.len()).as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
    Ok(buf)
}

/// Render `delete <key>`, optionally with a hide delay in seconds.
pub(crate) fn delete(key: &[u8], delay: Option<u32>) -> Result<Vec<u8>, ProtocolError> {
    check_key(key)?;
    let mut buf = Vec::with_capacity(key.len() + 20);
    buf.extend_from_slice(b"delete ");
    buf.extend_from_slice(key);
    if let Some(delay) = delay {
        buf.extend_from_slice(format!(" {}", delay).as_bytes());
    }
    buf.extend_from_slice(CRLF);
    Ok(buf)
}

/// Render `incr <key> <delta>`.
pub(crate) fn incr(key: &[u8], delta: u64) -> Result<Vec<u8>, ProtocolError> {
    check_key(key)?;
    let mut buf = Vec::with_capacity(key.len() + 28);
    buf.extend_from_slice(b"incr ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(format!(" {}", delta).as_bytes());
    buf.extend_from_slice(CRLF);
    Ok(buf)
}

/// Render `version`, the no-op used as a connection liveness probe.
pub(crate) fn version() -> Vec<u8> {
    b"version\r\n".to_vec()
}
