//! Content hashing for integrity headers.
//!
//! Every digest is computed by streaming: bytes pass through a fixed read
//! buffer into both hash functions, so no more than one buffer of the source
//! is held in memory. The 20-byte SHA-1 is what the remote verifies; the
//! 32-byte BLAKE2b (the first half of a BLAKE2b-512 digest) is stored as file
//! info. Both are rendered as lowercase hex.

use blake2::Blake2b512;
use sha1::{Digest, Sha1};
use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};
use thiserror::Error;

pub const SHA1_LEN: usize = 20;
pub const BLAKE2B_LEN: usize = 32;

const READ_BUF_SIZE: usize = 1024 * 256;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Source ended after {read} of {expected} bytes")]
    Truncated { expected: u64, read: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digests {
    pub sha1: String,
    pub blake2b: String,
    pub len: u64,
}

#[derive(Clone, Default)]
pub struct ContentHasher {
    sha1: Sha1,
    blake2b: Blake2b512,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher::default()
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.sha1.update(buf);
        self.blake2b.update(buf);
        self.len += buf.len() as u64;
    }

    pub fn finish(self) -> Digests {
        let sha1 = self.sha1.finalize();
        let blake2b = self.blake2b.finalize();
        Digests {
            sha1: hex::encode(&sha1[..SHA1_LEN]),
            blake2b: hex::encode(&blake2b[..BLAKE2B_LEN]),
            len: self.len,
        }
    }

    /// Feeds exactly `len` bytes from `reader`. A short source is an error.
    pub fn consume(&mut self, reader: &mut impl Read, len: u64) -> Result<(), Error> {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(Error::Truncated {
                        expected: len,
                        read: len - remaining,
                    })
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// Forwards writes to the next writer while hashing everything that passes.
pub struct HashingWriter<W: io::Write> {
    hasher: ContentHasher,
    next_writer: W,
}

impl<W: io::Write> HashingWriter<W> {
    pub fn new(next_writer: W) -> Self {
        HashingWriter {
            hasher: ContentHasher::new(),
            next_writer,
        }
    }

    pub fn finish(self) -> (W, Digests) {
        (self.next_writer, self.hasher.finish())
    }
}

impl<W: io::Write> io::Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.next_writer.write(buf)?;
        self.hasher.update(&buf[..len]);
        Ok(len)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.next_writer.flush()
    }
}

pub fn hash_bytes(data: &[u8]) -> Digests {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Hashes a whole file, checking that as many bytes were read as its metadata reports.
pub fn hash_file(path: impl AsRef<Path>) -> Result<Digests, Error> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut hasher = ContentHasher::new();
    hasher.consume(&mut file, len)?;
    Ok(hasher.finish())
}
