//! # Chunker
//!
//! Splits a file into fixed-size pieces for upload as individual blob
//! objects. Files below the inline threshold never reach the chunker; their
//! contents are embedded directly into the inode payload, saving one round
//! trip per small file.

use std::io::{ErrorKind, Read};

/// Size of each chunk produced by [`FixedChunker`] (1 MiB).
pub const CHUNK_SIZE: usize = 1 << 20;

/// Iterates over a reader and yields `(offset, bytes)` pairs of at most
/// [`CHUNK_SIZE`] bytes until EOF.
///
/// The final chunk may be shorter. Offsets are byte positions within the
/// source and are recorded in the inode's chunk list so restore can write
/// each blob back at the right place.
pub struct FixedChunker<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> FixedChunker<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }
}

impl<R: Read> Iterator for FixedChunker<R> {
    type Item = std::io::Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;

        while filled < CHUNK_SIZE {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }

        if filled == 0 {
            return None;
        }

        buf.truncate(filled);
        let pos = self.offset;
        self.offset += filled as u64;
        Some(Ok((pos, buf)))
    }
}
