//! Bulk store transfer format.
//!
//! ```text
//! MAGIC:i32  VERSION:u8
//! { keyLen:i32  valueLen:i32  extentId:i64  key  value }*
//! -1:i32
//! ```
//!
//! All integers are big-endian. A negative key length where a record would
//! start terminates the stream; a negative value length is corruption.

use bytes::{Buf, BufMut, BytesMut};
use gridstore_common::{ExtentId, PersistenceError, Result};
use std::io::{self, Read, Write};

/// Stream magic
pub const MAGIC: i32 = 0x6A68_3735;

/// Highest stream version this codec reads and the version it writes
pub const VERSION: u8 = 0;

const TERMINATOR: i32 = -1;
const RECORD_HEADER_LEN: usize = 4 + 4 + 8;

/// One `(extent, key, value)` entry of a transferred store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub extent: ExtentId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Writes the transfer format to an output stream
pub struct RecordWriter<W: Write> {
    out: W,
    header: BytesMut,
    records: u64,
}

impl<W: Write> RecordWriter<W> {
    /// Write the stream header
    pub fn new(mut out: W) -> Result<Self> {
        let mut header = BytesMut::with_capacity(RECORD_HEADER_LEN);
        header.put_i32(MAGIC);
        header.put_u8(VERSION);
        out.write_all(&header)?;
        header.clear();
        Ok(Self {
            out,
            header,
            records: 0,
        })
    }

    pub fn write_record(&mut self, extent: ExtentId, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = i32::try_from(key.len())
            .map_err(|_| PersistenceError::illegal_argument("key too large to transfer"))?;
        let value_len = i32::try_from(value.len())
            .map_err(|_| PersistenceError::illegal_argument("value too large to transfer"))?;

        self.header.clear();
        self.header.put_i32(key_len);
        self.header.put_i32(value_len);
        self.header.put_i64(extent);
        self.out.write_all(&self.header)?;
        self.out.write_all(key)?;
        self.out.write_all(value)?;
        self.records += 1;
        Ok(())
    }

    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Write the terminator and flush, returning the output stream
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&TERMINATOR.to_be_bytes())?;
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads the transfer format from an input stream
pub struct RecordReader<R: Read> {
    input: R,
    version: u8,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    /// Read and validate the stream header
    pub fn new(mut input: R) -> Result<Self> {
        let mut header = [0u8; 5];
        input.read_exact(&mut header)?;
        let mut buf = &header[..];
        if buf.get_i32() != MAGIC {
            return Err(PersistenceError::corrupted("the data stream is unrecognized"));
        }
        let version = buf.get_u8();
        if version > VERSION {
            return Err(PersistenceError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "the data stream is a newer version ({version}) than is supported ({VERSION})"
                ),
            )));
        }
        Ok(Self {
            input,
            version,
            done: false,
        })
    }

    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Next record, or `None` once the terminator has been read
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }

        let mut len = [0u8; 4];
        self.input.read_exact(&mut len)?;
        let key_len = i32::from_be_bytes(len);
        if key_len < 0 {
            self.done = true;
            return Ok(None);
        }

        let mut rest = [0u8; 12];
        self.input.read_exact(&mut rest)?;
        let mut buf = &rest[..];
        let value_len = buf.get_i32();
        if value_len < 0 {
            return Err(PersistenceError::corrupted(format!(
                "negative value length {value_len}"
            )));
        }
        let extent = buf.get_i64();

        let key = self.read_exact_vec(key_len, "key")?;
        let value = self.read_exact_vec(value_len, "value")?;
        Ok(Some(Record { extent, key, value }))
    }

    fn read_exact_vec(&mut self, len: i32, what: &str) -> Result<Vec<u8>> {
        let len = usize::try_from(len).unwrap_or_default();
        let mut data = vec![0u8; len];
        self.input.read_exact(&mut data).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                PersistenceError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("expected {len} bytes for {what} but reached end of stream"),
                ))
            } else {
                PersistenceError::Io(e)
            }
        })?;
        Ok(data)
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Whether a transfer failure should discard the partially imported store
#[must_use]
pub fn is_stream_failure(e: &PersistenceError) -> bool {
    matches!(
        e.root(),
        PersistenceError::Io(_) | PersistenceError::StreamCorrupted(_)
    )
}
