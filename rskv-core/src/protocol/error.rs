use std::fmt::{Display, Formatter, Result as FmtResult};

/// An error caused by a request or response that does not fit the memcached
/// text protocol.
#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    /// The key is too long or contains whitespace or control bytes.
    InvalidKey(Vec<u8>),
    /// A `VALUE` header line could not be parsed.
    BadValueHeader(String),
    /// A data block was not terminated by CRLF.
    BadDataBlock,
    /// The server sent a line this client does not understand.
    UnexpectedLine(String),
    /// The server reported `ERROR`, `CLIENT_ERROR` or `SERVER_ERROR`.
    Server(String),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ProtocolError::InvalidKey(key) => {
                write!(f, "Invalid key: {:?}", String::from_utf8_lossy(key))
            }
            ProtocolError::BadValueHeader(line) => write!(f, "Bad VALUE header: {}", line),
            ProtocolError::BadDataBlock => write!(f, "Data block not CRLF-terminated"),
            ProtocolError::UnexpectedLine(line) => write!(f, "Unexpected line: {}", line),
            ProtocolError::Server(msg) => write!(f, "Server error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
