use std::io::Write;

use bytes::Bytes;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use crate::client::{Compressor, Error};

/// The minimum number of bytes before the Zlib compressor starts
/// compressing data. Tiny values cost more to inflate than to send.
pub const DEFAULT_MIN_BYTES: usize = 128;

/// Value-flag bit marking a zlib-compressed payload.
pub const FLAG_ZLIB: u32 = 0x10;

/// A compressor that implements zlib compression and decompression,
/// recording the encoding in the value flag.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    compression: Compression,
    min_bytes: usize,
}

impl ZlibCompressor {
    /// Construct a new zlib compressor with the given compression ratio and
    /// min_bytes. Values smaller than min_bytes will not get compressed.
    pub fn new(compression: Compression, min_bytes: usize) -> Self {
        ZlibCompressor {
            compression,
            min_bytes,
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        ZlibCompressor::new(Compression::default(), DEFAULT_MIN_BYTES)
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&self, value: Vec<u8>) -> Result<(Vec<u8>, u32), Error> {
        if value.len() < self.min_bytes {
            return Ok((value, 0));
        }

        let mut out = vec![];
        let mut enc = ZlibEncoder::new(&mut out, self.compression);
        enc.write_all(&value)?;
        enc.finish()?;
        Ok((out, FLAG_ZLIB))
    }

    fn decompress(&self, value: Bytes, flags: u32) -> Result<Bytes, Error> {
        if flags & FLAG_ZLIB == 0 {
            // This value was stored uncompressed.
            return Ok(value);
        }

        let mut out = vec![];
        let mut dec = ZlibDecoder::new(&mut out);
        dec.write_all(&value)?;
        dec.finish()?;
        Ok(Bytes::from(out))
    }
}
