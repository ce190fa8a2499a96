//! # Compression
//!
//! Optional zlib framing for object payloads. Compression is applied before
//! encryption on the way out and undone after decryption on the way in.
//!
//! The decoder never needs to be told whether a payload was compressed: zlib
//! streams always begin with byte `0x78`, while plaintext payloads begin with
//! a msgpack-tagged type string (`0xa0`–`0xbf` for fixstr, or `0xd9`–`0xdb`),
//! so the first byte is unambiguous. This lets compressed and uncompressed
//! objects coexist in one repository, e.g. after toggling the setting.

use crate::error::{CorruptedRepository, Result};
use std::io::{Read, Write};

/// First byte of every zlib stream.
pub const ZLIB_MAGIC: u8 = 0x78;

/// Compresses a payload when compression is enabled, otherwise returns it
/// unchanged.
pub fn compress(data: &[u8], enabled: bool) -> Result<Vec<u8>> {
    if !enabled {
        return Ok(data.to_vec());
    }

    let mut encoder = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::default(),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Undoes [`compress`], auto-detecting whether the input is a zlib stream.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    match data.first() {
        Some(&ZLIB_MAGIC) => {
            let mut decoder = flate2::read::ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CorruptedRepository(format!("zlib stream is invalid: {e}")))?;
            Ok(out)
        }
        _ => Ok(data.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_compressed() {
        let data = b"some payload bytes that repeat repeat repeat repeat repeat";
        let packed = compress(data, true).unwrap();
        assert_eq!(packed[0], ZLIB_MAGIC);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn roundtrip_passthrough() {
        let data = b"\xa4blob raw contents";
        let packed = compress(data, false).unwrap();
        assert_eq!(packed, data);
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn compresses_repetitive_data() {
        let data = vec![0u8; 10_000];
        let packed = compress(&data, true).unwrap();
        assert!(packed.len() < data.len());
    }

    #[test]
    fn payload_first_byte_never_collides_with_magic() {
        // A payload always starts with a msgpack string marker for the type
        // tag, never 0x78.
        for tag in ["blob", "inode", "tree", "snapshot"] {
            let mut buf = Vec::new();
            rmp::encode::write_str(&mut buf, tag).unwrap();
            assert_ne!(buf[0], ZLIB_MAGIC);
        }
    }

    #[test]
    fn truncated_zlib_is_an_error() {
        let packed = compress(b"hello world hello world", true).unwrap();
        assert!(decompress(&packed[..4]).is_err());
    }
}
