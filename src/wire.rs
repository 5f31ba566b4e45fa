//! Length-prefixed message framing.
//!
//! Every message is a little-endian `u64` payload length followed by the
//! bincode encoding of one value. A stream may open with a 4-byte magic
//! number checked by [`WireReader::expect_magic`].

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

pub struct WireWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    pub fn write_magic(&mut self, magic: u32) -> Result<()> {
        self.inner.write_all(&magic.to_le_bytes())?;
        self.written += 4;
        Ok(())
    }

    /// Frame and write a single message.
    pub fn write_message<T: Serialize + ?Sized>(&mut self, msg: &T) -> Result<()> {
        let len = bincode::serialized_size(msg)?;
        self.inner.write_all(&len.to_le_bytes())?;
        bincode::serialize_into(&mut self.inner, msg)?;
        self.written += 8 + len;
        Ok(())
    }

    /// Append bytes that are already framed (e.g. a series encoded on
    /// another thread).
    pub fn write_framed(&mut self, framed: &[u8]) -> Result<()> {
        self.inner.write_all(framed)?;
        self.written += framed.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct WireReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    consumed: u64,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            consumed: 0,
        }
    }

    pub fn expect_magic(&mut self, magic: u32) -> Result<()> {
        let mut raw = [0u8; 4];
        self.fill(&mut raw)?;
        let found = u32::from_le_bytes(raw);
        if found != magic {
            return Err(Error::corrupt(format!(
                "bad magic: expected {magic:#010x}, found {found:#010x}"
            )));
        }
        Ok(())
    }

    /// Read and decode the next message.
    ///
    /// The payload is pulled through `take` so a forged length cannot force
    /// a large allocation up front.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut raw = [0u8; 8];
        self.fill(&mut raw)?;
        let len = u64::from_le_bytes(raw);

        self.buf.clear();
        let got = (&mut self.inner).take(len).read_to_end(&mut self.buf)? as u64;
        self.consumed += got;
        if got < len {
            return Err(Error::corrupt(format!(
                "message truncated: expected {len} bytes, got {got}"
            )));
        }

        // The payload is already in memory: any decode failure, including a
        // short read inside it, is a malformed message.
        bincode::deserialize(&self.buf)
            .map_err(|e| Error::corrupt(format!("undecodable message: {e}")))
    }

    /// Total bytes consumed from the underlying reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.consumed
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self, raw: &mut [u8]) -> Result<()> {
        self.inner.read_exact(raw).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::corrupt("unexpected end of stream"),
            _ => Error::Io(e),
        })?;
        self.consumed += raw.len() as u64;
        Ok(())
    }
}
