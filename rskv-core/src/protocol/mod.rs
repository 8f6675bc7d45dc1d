//! The subset of the memcached text protocol this client speaks: retrieval
//! and storage commands, delete with an optional hide delay, incr, and the
//! version probe used for connection health checks. Requests are rendered to
//! byte buffers up front; responses are parsed incrementally so a caller can
//! keep reading from the socket until a parser reports completion.

mod error;
mod request;
mod response;

pub use error::ProtocolError;

pub(crate) use request::{delete, get, incr, set, version};
pub(crate) use response::{parse_deleted, parse_incr, parse_stored, parse_values, parse_version};

/// Longest key the wire format accepts.
pub const MAX_KEY_LEN: usize = 250;

pub(crate) const CRLF: &[u8] = b"\r\n";
