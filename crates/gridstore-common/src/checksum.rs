//! Streaming CRC32C checksums for archived store files

use std::io::{self, Read, Write};

/// Checksum and length of a byte stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreChecksum {
    pub crc32c: u32,
    pub length: u64,
}

impl StoreChecksum {
    /// Compute over an in-memory buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            length: data.len() as u64,
        }
    }

    fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.length += data.len() as u64;
    }

    /// Hex encoding used in archive metadata
    #[must_use]
    pub fn to_hex(&self) -> String {
        format!("{:08x}", self.crc32c)
    }

    /// Parse the crc from its hex encoding
    #[must_use]
    pub fn parse_crc(hex: &str) -> Option<u32> {
        u32::from_str_radix(hex.trim(), 16).ok()
    }
}

/// Writer adapter that checksums everything written through it
pub struct ChecksumWriter<W> {
    inner: W,
    checksum: StoreChecksum,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            checksum: StoreChecksum::default(),
        }
    }

    #[must_use]
    pub const fn checksum(&self) -> StoreChecksum {
        self.checksum
    }

    /// Unwrap, returning the inner writer and the final checksum
    pub fn into_inner(self) -> (W, StoreChecksum) {
        (self.inner, self.checksum)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checksum.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that checksums everything read through it
pub struct ChecksumReader<R> {
    inner: R,
    checksum: StoreChecksum,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            checksum: StoreChecksum::default(),
        }
    }

    #[must_use]
    pub const fn checksum(&self) -> StoreChecksum {
        self.checksum
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.checksum.update(&buf[..n]);
        Ok(n)
    }
}
